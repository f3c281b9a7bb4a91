use std::sync::{Arc, Barrier};

use crate::scenarios::{shared_lock, spawn_worker};

pub fn start() -> Result<(), String> {
    let inventory = shared_lock("demo.inventory");
    let orders = shared_lock("demo.orders");
    let ready = Arc::new(Barrier::new(2));

    for (name, first, second) in [
        ("entry.alpha", Arc::clone(&inventory), Arc::clone(&orders)),
        ("entry.beta", Arc::clone(&orders), Arc::clone(&inventory)),
    ] {
        let ready = Arc::clone(&ready);
        spawn_worker(name, move || {
            let _first_guard = first.lock();
            println!("{name} entered {}", first.id());

            ready.wait();

            println!("{name} entering {}; interrupts cannot break this wait", second.id());
            let _second_guard = second.lock();
            println!("{name} unexpectedly entered {}", second.id());
        })?;
    }

    println!("two threads should block for good on demo.inventory/demo.orders");
    Ok(())
}
