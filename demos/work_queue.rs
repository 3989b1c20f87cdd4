use bounded_mpmc::driver::{Consumer, Producer};
use bounded_mpmc::{Config, PushTimeout, Queue};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    bounded_mpmc::init_tracing();
    println!("Work Queue Example\n");

    const NUM_WORKERS: usize = 4;
    const NUM_JOBS: usize = 20;
    const MAX_RETRIES: u32 = 5;

    let config = Config::new().with_timeout(Duration::from_millis(100));
    let jobs = Arc::new(Queue::<String, 8>::with_config(config));
    let results = Arc::new(Queue::<String, 32>::with_config(config));

    let jobs_tx = jobs.clone();
    let producer = thread::spawn(move || {
        let jobs = (0..NUM_JOBS).map(|i| format!("Job-{:02}", i));
        let report = Producer::new(&jobs_tx, MAX_RETRIES).run(jobs);
        println!("All jobs enqueued: {:?}", report);
    });

    let mut workers = vec![];
    for worker_id in 0..NUM_WORKERS {
        let jobs_rx = jobs.clone();
        let results_tx = results.clone();

        workers.push(thread::spawn(move || {
            let report = Consumer::new(&jobs_rx, MAX_RETRIES).run(|job| {
                println!("Worker {} processing: {}", worker_id, job);
                thread::sleep(Duration::from_millis(20));

                let mut result = format!("{} -> completed by worker {}", job, worker_id);
                while let Err(PushTimeout(rejected)) = results_tx.push(result) {
                    result = rejected;
                }
            });
            println!("Worker {} finished ({} jobs)", worker_id, report.delivered);
        }));
    }

    producer.join().unwrap();
    for worker in workers {
        worker.join().unwrap();
    }

    let mut collected = 0;
    while let Ok(result) = results.try_pop() {
        println!("Result: {}", result);
        collected += 1;
    }
    println!("\n{} of {} results collected", collected, NUM_JOBS);
}
