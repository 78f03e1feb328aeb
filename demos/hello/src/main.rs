//! Producer/consumer handoff on the simulated kernel.

use skein::prelude::*;
use skein::sync::{Condvar, Mutex};
use skein_kernel_sim::SimKernel;
use static_cell::StaticCell;
use std::sync::Arc;
use std::time::Duration;

struct StdoutLogger;

impl log::Log for StdoutLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        println!("[{:5}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: StdoutLogger = StdoutLogger;
static KERNEL: StaticCell<SimKernel> = StaticCell::new();

fn main() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Info);

    let kernel: &'static SimKernel = KERNEL.init(SimKernel::new());
    kernel.start(|k| {
        let queue = Arc::new(Mutex::new(k, Vec::<u32>::new()));
        let items = Arc::new(Condvar::new(k));

        let producer_queue = Arc::clone(&queue);
        let producer_items = Arc::clone(&items);
        let mut producer = Builder::new()
            .name("producer")
            .priority(Priority::new(5))
            .spawn(k, move || {
                for item in 1..=5u32 {
                    thread::sleep(k, Duration::from_millis(10));
                    producer_queue.lock().push(item);
                    log::info!("produced {}", item);
                    producer_items.notify_one();
                }
            })
            .unwrap();

        let consumer_queue = Arc::clone(&queue);
        let consumer_items = Arc::clone(&items);
        let mut consumer = Builder::new()
            .name("consumer")
            .priority(Priority::new(4))
            .spawn(k, move || {
                let mut received = 0;
                while received < 5 {
                    let guard = consumer_queue.lock();
                    let mut guard = consumer_items.wait_while(guard, |queue| queue.is_empty());
                    while let Some(item) = guard.pop() {
                        log::info!("consumed {}", item);
                        received += 1;
                    }
                }
            })
            .unwrap();

        producer.join().unwrap();
        consumer.join().unwrap();
        log::info!("handoff complete");
    });
    kernel.quiesce();
}
