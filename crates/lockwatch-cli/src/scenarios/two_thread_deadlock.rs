use std::sync::{Arc, Barrier};

use lockwatch_locks::TrackedMutex;

use crate::scenarios::{shared_lock, spawn_worker};

fn spawn_transfer(
    name: &'static str,
    first: Arc<TrackedMutex<()>>,
    second: Arc<TrackedMutex<()>>,
    ready: Arc<Barrier>,
) -> Result<(), String> {
    spawn_worker(name, move || {
        let _first_guard = first.lock();
        println!("{name} locked {}; waiting for peer", first.id());

        ready.wait();

        println!("{name} attempting {}; lock order is inverted", second.id());
        match second.lock_interruptibly() {
            Ok(_second_guard) => println!("{name} acquired {}; transfer done", second.id()),
            Err(err) => println!("{name} gave up on {}: {err}", second.id()),
        }
    })?;
    Ok(())
}

pub fn start() -> Result<(), String> {
    let accounts = shared_lock("demo.accounts");
    let ledger = shared_lock("demo.ledger");
    let ready = Arc::new(Barrier::new(2));

    spawn_transfer(
        "transfer.alpha",
        Arc::clone(&accounts),
        Arc::clone(&ledger),
        Arc::clone(&ready),
    )?;
    spawn_transfer(
        "transfer.beta",
        Arc::clone(&ledger),
        Arc::clone(&accounts),
        Arc::clone(&ready),
    )?;

    println!("two transfers should deadlock on demo.accounts/demo.ledger");
    Ok(())
}
