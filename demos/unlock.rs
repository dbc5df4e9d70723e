//! Basic example: find the lock, connect, unlock, disconnect
//!
//! Run with: cargo run --example unlock

use ble_door_lock::{Event, LockConfig, LockManager, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_door_lock=debug".parse().unwrap()),
        )
        .init();

    println!("Scanning for the door lock...");

    let manager = LockManager::with_btleplug(LockConfig::default()).await?;
    let mut events = manager.subscribe();

    manager.start_scan()?;

    while let Some(event) = events.recv().await {
        println!("{}: {}", event.kind(), event.value().unwrap_or("-"));

        match event {
            Event::ScanResult(Some(address)) => {
                println!("Found lock at {}", address);
                manager.connect()?;
            }
            Event::ScanResult(None) => {
                println!("No lock found. Is it powered and in range?");
                break;
            }
            Event::Connected => {
                println!("Connected, sending unlock");
                manager.write_unlock()?;
            }
            Event::WriteAck => {
                println!("Unlock acknowledged");
                manager.disconnect()?;
            }
            Event::Disconnected => {
                println!("Disconnected");
                break;
            }
        }
    }

    manager.shutdown().await?;

    Ok(())
}
