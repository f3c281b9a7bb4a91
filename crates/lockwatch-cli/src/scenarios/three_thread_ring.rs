use std::sync::{Arc, Barrier};

use lockwatch_locks::set_current_priority;

use crate::scenarios::{shared_lock, spawn_worker};

const PHILOSOPHERS: [(&str, i32); 3] = [
    ("philosopher.0", 5),
    ("philosopher.1", 1),
    ("philosopher.2", 3),
];

pub fn start() -> Result<(), String> {
    let forks: Vec<_> = (0..PHILOSOPHERS.len())
        .map(|i| shared_lock(&format!("demo.fork.{i}")))
        .collect();
    let ready = Arc::new(Barrier::new(PHILOSOPHERS.len()));

    for (i, &(name, priority)) in PHILOSOPHERS.iter().enumerate() {
        let left = Arc::clone(&forks[i]);
        let right = Arc::clone(&forks[(i + 1) % forks.len()]);
        let ready = Arc::clone(&ready);
        spawn_worker(name, move || {
            set_current_priority(priority);
            let _left_guard = left.lock();
            println!("{name} (priority {priority}) picked up {}", left.id());

            ready.wait();

            match right.lock_interruptibly() {
                Ok(_right_guard) => println!("{name} picked up {} and ate", right.id()),
                Err(err) => println!("{name} put {} back: {err}", left.id()),
            }
        })?;
    }

    println!("three philosophers should deadlock in a ring; philosopher.1 has the lowest priority");
    Ok(())
}
