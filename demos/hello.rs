//! Spawn a handful of balanced tasks and wait for them.
//!
//! ```sh
//! cargo run --example hello -- --minNumCores=4
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

use filament::{Config, create_thread, current_core_id, init, join, shut_down,
    wait_for_termination};

static DONE: AtomicU32 = AtomicU32::new(0);

fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::from_args(std::env::args()).expect("bad flags");
    init(config).expect("runtime init failed");

    let ids: Vec<_> = (0..8)
        .map(|i| {
            create_thread(move || {
                println!("task {i} on core {:?}", current_core_id());
                DONE.fetch_add(1, Ordering::SeqCst);
            })
            .expect("a slot is free")
        })
        .collect();

    for id in ids {
        join(id);
    }
    println!("all {} tasks done", DONE.load(Ordering::SeqCst));

    shut_down();
    wait_for_termination();
}
