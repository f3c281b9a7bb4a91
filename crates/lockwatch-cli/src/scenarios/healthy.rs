use std::sync::Arc;
use std::time::Duration;

use lockwatch_locks::is_interrupted;

use crate::scenarios::{shared_lock, spawn_worker};

const WORKERS: usize = 4;

pub fn start() -> Result<(), String> {
    let counter = shared_lock("demo.counter");
    let journal = shared_lock("demo.journal");

    for i in 0..WORKERS {
        let counter = Arc::clone(&counter);
        let journal = Arc::clone(&journal);
        let name = format!("healthy.worker.{i}");
        let label = name.clone();
        spawn_worker(&name, move || {
            let mut rounds = 0u64;
            while !is_interrupted() {
                {
                    // consistent order: counter before journal
                    let _counter = counter.lock();
                    let _journal = journal.lock();
                    rounds += 1;
                }
                if rounds % 100 == 0 {
                    println!("{label} finished {rounds} rounds");
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            println!("{label} interrupted after {rounds} rounds");
        })?;
    }

    println!("{WORKERS} workers contend on demo.counter/demo.journal in a consistent order; no deadlock expected");
    Ok(())
}
