//! Three producer/consumer pairs push and pop through an 8-slot queue and
//! report how far the running total ended from zero.
//!
//! Run with `--features tracing` to see driver aborts.

use bounded_mpmc::driver::{balance, BalanceSettings};

fn main() {
    bounded_mpmc::init_tracing();

    let report = balance::<8>(BalanceSettings {
        pairs: 3,
        items: 100,
        max_retries: 20,
        ..BalanceSettings::default()
    });

    println!("Final outcome is {}", report.net);
    println!(
        "pushed {} popped {} margin {:.4}{}",
        report.pushed,
        report.popped,
        report.margin(),
        if report.is_acceptable() { "" } else { " (too high)" }
    );
}
