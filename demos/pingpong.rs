//! Measure the cost of a cooperative handoff: two tasks on one core yield
//! to each other as fast as they can.
//!
//! ```sh
//! cargo run --release --example pingpong
//! ```

use std::time::Instant;

use filament::{Config, create_thread_on_core, init, join, shut_down, wait_for_termination,
    yield_now};

const ROUNDS: u32 = 1_000_000;

fn main() {
    tracing_subscriber::fmt::init();

    init(Config {
        num_cores: Some(1),
    })
    .expect("runtime init failed");

    let start = Instant::now();
    let player = || {
        for _ in 0..ROUNDS {
            yield_now();
        }
    };
    let a = create_thread_on_core(0, player).expect("a slot is free");
    let b = create_thread_on_core(0, player).expect("a slot is free");
    join(a);
    join(b);

    let elapsed = start.elapsed();
    let switches = u64::from(ROUNDS) * 2;
    println!(
        "{switches} yields in {elapsed:?} ({:.0} ns per handoff)",
        elapsed.as_nanos() as f64 / switches as f64
    );

    shut_down();
    wait_for_termination();
}
