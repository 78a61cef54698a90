//! Property Watch Demo
//!
//! Demonstrates lock-free reads next to a writer and an async watcher.
//!
//! Type `KEY=VALUE` lines; an empty line quits. A watcher task prints every
//! change of the global serial, two reader threads poll the last key set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysprop::{PropertyStore, StoreConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let store = Arc::new(PropertyStore::init(&StoreConfig::from_env())?);
    let last_key = Arc::new(Mutex::new(None::<String>));
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = ["r1", "r2"]
        .into_iter()
        .map(|name| {
            let store = Arc::clone(&store);
            let last_key = Arc::clone(&last_key);
            let done = Arc::clone(&done);
            std::thread::spawn(move || poll_last_key(name, &store, &last_key, &done))
        })
        .collect();

    let watcher_store = Arc::clone(&store);
    let watcher = tokio::spawn(async move {
        let mut serial = watcher_store.serial();
        loop {
            serial = watcher_store.wait_any_async(serial).await;
            println!("(watcher) serial={serial}, {} properties", watcher_store.len());
        }
    });

    write_all(&store, &last_key).await;

    done.store(true, Ordering::Release);
    watcher.abort();
    for reader in readers {
        let _ = reader.join();
    }

    store.list(|name, value| println!("[{name}]: [{value}]"));
    Ok(())
}

async fn write_all(store: &PropertyStore, last_key: &Mutex<Option<String>>) {
    println!("Enter KEY=VALUE (empty line to quit):");

    let stdin = tokio::io::stdin();
    let reader = tokio::io::BufReader::new(stdin);
    let mut lines = tokio::io::AsyncBufReadExt::lines(reader);

    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            eprintln!("expected KEY=VALUE");
            continue;
        };
        match store.set(key.trim(), value.trim()) {
            Ok(()) => *last_key.lock() = Some(key.trim().to_string()),
            Err(e) => eprintln!("set failed: {e}"),
        }
    }
}

fn poll_last_key(
    name: &str,
    store: &PropertyStore,
    last_key: &Mutex<Option<String>>,
    done: &AtomicBool,
) {
    let mut seen = None;
    while !done.load(Ordering::Acquire) {
        let key = last_key.lock().clone();
        if let Some(key) = key {
            let value = store.get(&key);
            if value != seen {
                println!("({name}) {key} = {value:?}");
                seen = value;
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
