//! Producer/consumer drivers with a bounded retry budget, and the balance
//! harness that runs them in pairs to check that nothing is lost.
//!
//! A queue call that times out is transient backpressure. The drivers retry
//! it and give up once `max_retries` consecutive calls have timed out.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crate::trace::debug;
use crate::{Config, PushTimeout, Queue};

/// Largest accepted `|net| / worst_case` for a balance run.
pub const ACCEPTABLE_MARGIN: f64 = 0.02;

/// What a driver did before it stopped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverReport {
    /// Values successfully pushed (producer) or popped (consumer).
    pub delivered: usize,
    /// Queue calls that timed out, retried or not.
    pub timeouts: usize,
    /// Whether the retry budget ran out.
    pub aborted: bool,
}

/// Pushes a sequence of values, retrying each timed-out push.
pub struct Producer<'q, T, const CAP: usize> {
    queue: &'q Queue<T, CAP>,
    max_retries: u32,
}

impl<'q, T, const CAP: usize> Producer<'q, T, CAP> {
    /// A producer that aborts after `max_retries` consecutive timeouts.
    pub fn new(queue: &'q Queue<T, CAP>, max_retries: u32) -> Self {
        Producer { queue, max_retries }
    }

    /// Push `items` in order.
    ///
    /// On abort the item being pushed and everything after it is dropped, so
    /// the pushed values are always a prefix of `items`.
    pub fn run<I>(&self, items: I) -> DriverReport
    where
        I: IntoIterator<Item = T>,
    {
        let mut report = DriverReport::default();
        let mut retries = 0;

        for mut item in items {
            loop {
                match self.queue.push(item) {
                    Ok(()) => {
                        report.delivered += 1;
                        retries = 0;
                        break;
                    }
                    Err(PushTimeout(rejected)) => {
                        report.timeouts += 1;
                        retries += 1;
                        if retries > self.max_retries {
                            debug!(
                                delivered = report.delivered,
                                timeouts = report.timeouts,
                                "producer out of retries"
                            );
                            report.aborted = true;
                            return report;
                        }
                        item = rejected;
                    }
                }
            }
        }
        report
    }
}

/// Pops until the queue has stayed empty for more than `max_retries`
/// consecutive timeouts.
pub struct Consumer<'q, T, const CAP: usize> {
    queue: &'q Queue<T, CAP>,
    max_retries: u32,
}

impl<'q, T, const CAP: usize> Consumer<'q, T, CAP> {
    /// A consumer that stops after `max_retries` consecutive timeouts.
    pub fn new(queue: &'q Queue<T, CAP>, max_retries: u32) -> Self {
        Consumer { queue, max_retries }
    }

    /// Feed every popped value to `sink`. Always ends aborted: there is no
    /// other way to tell that producers are done.
    pub fn run<F>(&self, mut sink: F) -> DriverReport
    where
        F: FnMut(T),
    {
        let mut report = DriverReport::default();
        let mut retries = 0;

        loop {
            match self.queue.pop() {
                Ok(value) => {
                    sink(value);
                    report.delivered += 1;
                    retries = 0;
                }
                Err(_) => {
                    report.timeouts += 1;
                    retries += 1;
                    if retries > self.max_retries {
                        debug!(
                            delivered = report.delivered,
                            timeouts = report.timeouts,
                            "consumer out of retries"
                        );
                        report.aborted = true;
                        return report;
                    }
                }
            }
        }
    }
}

/// Parameters of a [`balance`] run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceSettings {
    /// Number of consumer/producer thread pairs.
    pub pairs: usize,
    /// Each producer pushes `1..items`.
    pub items: i64,
    /// Retry budget of every driver.
    pub max_retries: u32,
    /// Wait policy of the shared queue.
    pub queue: Config,
}

impl Default for BalanceSettings {
    fn default() -> Self {
        BalanceSettings {
            pairs: 1,
            items: 1_000,
            max_retries: 10,
            queue: Config::default(),
        }
    }
}

/// Result of a [`balance`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceReport {
    /// Sum pushed minus sum popped.
    pub net: i64,
    /// `items * (items + 1) / 2`, the imbalance margins are measured against.
    pub worst_case: i64,
    /// Values pushed across all producers.
    pub pushed: usize,
    /// Values popped across all consumers.
    pub popped: usize,
}

impl BalanceReport {
    /// `|net| / worst_case`.
    pub fn margin(&self) -> f64 {
        if self.worst_case == 0 {
            return 0.0;
        }
        (self.net as f64 / self.worst_case as f64).abs()
    }

    /// Whether the imbalance stays under [`ACCEPTABLE_MARGIN`].
    pub fn is_acceptable(&self) -> bool {
        self.margin() < ACCEPTABLE_MARGIN
    }
}

/// Spawn `pairs` consumer/producer pairs over one `Queue<i64, CAP>` and
/// track the running total of pushed minus popped values.
///
/// Timeouts count as silent drops, so the total is only expected to land
/// near zero, not on it.
///
/// # Panics
///
/// Panics if `CAP` is not a non-zero power of two, or if a driver thread
/// panics.
pub fn balance<const CAP: usize>(settings: BalanceSettings) -> BalanceReport {
    let queue = Arc::new(Queue::<i64, CAP>::with_config(settings.queue));
    let total = Arc::new(AtomicI64::new(0));
    let pushed = Arc::new(AtomicUsize::new(0));
    let popped = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::with_capacity(settings.pairs * 2);
    for _ in 0..settings.pairs {
        let (q, drained, popped) = (queue.clone(), total.clone(), popped.clone());
        handles.push(thread::spawn(move || {
            let report = Consumer::new(&q, settings.max_retries).run(|value| {
                drained.fetch_sub(value, Ordering::Relaxed);
            });
            popped.fetch_add(report.delivered, Ordering::Relaxed);
        }));

        let (q, filled, pushed) = (queue.clone(), total.clone(), pushed.clone());
        handles.push(thread::spawn(move || {
            let report = Producer::new(&q, settings.max_retries).run(1..settings.items);
            // Pushed values are the prefix 1..=delivered.
            let delivered = report.delivered as i64;
            filled.fetch_add(delivered * (delivered + 1) / 2, Ordering::Relaxed);
            pushed.fetch_add(report.delivered, Ordering::Relaxed);
        }));
    }

    for handle in handles {
        if let Err(panic) = handle.join() {
            std::panic::resume_unwind(panic);
        }
    }

    let report = BalanceReport {
        net: total.load(Ordering::Relaxed),
        worst_case: settings.items * (settings.items + 1) / 2,
        pushed: pushed.load(Ordering::Relaxed),
        popped: popped.load(Ordering::Relaxed),
    };
    debug!(
        net = report.net,
        pushed = report.pushed,
        popped = report.popped,
        margin = report.margin(),
        "balance run finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick() -> Config {
        Config::new().with_timeout(Duration::from_millis(5))
    }

    #[test]
    fn producer_pushes_everything_with_room() {
        let queue = Queue::<u32, 8>::with_config(quick());
        let report = Producer::new(&queue, 0).run(0..5);
        assert_eq!(report, DriverReport { delivered: 5, timeouts: 0, aborted: false });
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn producer_aborts_on_full_queue() {
        let queue = Queue::<u32, 2>::with_config(quick());
        let report = Producer::new(&queue, 3).run(0..10);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.timeouts, 4);
        assert!(report.aborted);
        assert_eq!(queue.pop(), Ok(0));
        assert_eq!(queue.pop(), Ok(1));
    }

    #[test]
    fn consumer_drains_then_gives_up() {
        let queue = Queue::<u32, 8>::with_config(quick());
        for i in 1..=4 {
            queue.push(i).unwrap();
        }
        let mut seen = Vec::new();
        let report = Consumer::new(&queue, 2).run(|v| seen.push(v));
        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert_eq!(report.delivered, 4);
        assert_eq!(report.timeouts, 3);
        assert!(report.aborted);
    }

    #[test]
    fn margin_of_empty_run_is_zero() {
        let report = BalanceReport { net: 0, worst_case: 0, pushed: 0, popped: 0 };
        assert_eq!(report.margin(), 0.0);
        assert!(report.is_acceptable());
    }

    #[test]
    fn single_pair_balances() {
        let report = balance::<16>(BalanceSettings {
            items: 200,
            queue: Config::new().with_timeout(Duration::from_millis(20)),
            ..BalanceSettings::default()
        });
        assert_eq!(report.pushed, 199);
        assert!(report.is_acceptable(), "{report:?}");
    }
}
