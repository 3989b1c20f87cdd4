//! Simple usage example

use bounded_mpmc::{PushTimeout, Queue};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    println!("bounded_mpmc - Simple Example\n");

    // Create a queue with 4 slots
    let queue = Arc::new(Queue::<String, 4>::new());

    let producer_queue = queue.clone();
    let consumer_queue = queue.clone();

    let producer = thread::spawn(move || {
        for i in 0..10 {
            let mut message = format!("Message {}", i);
            println!("Sending: {}", message);

            // A timeout hands the value back; try again with it.
            while let Err(PushTimeout(rejected)) = producer_queue.push(message) {
                println!("Queue full, retrying");
                message = rejected;
            }
        }
        println!("Producer finished!");
    });

    let consumer = thread::spawn(move || {
        for _ in 0..10 {
            match consumer_queue.pop() {
                Ok(message) => println!("Received: {}", message),
                Err(err) => println!("Gave up: {}", err),
            }
            thread::sleep(Duration::from_millis(50));
        }
        println!("Consumer finished!");
    });

    producer.join().unwrap();
    consumer.join().unwrap();

    println!("\nExample completed successfully! {} left over", queue.len());
}
