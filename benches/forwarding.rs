use overlay_routing::{Bytes, Message, Testnet};
use std::time::{Duration, Instant};

/// End-to-end latency of direct and group messages on an in-memory testnet.
///
/// Every hop goes through the dispatcher thread and the network thread, so
/// the useful signal is relative differences between runs, not absolute values.
fn main() {
    println!("forwarding\n");

    for size in [10, 50] {
        let testnet = Testnet::new(size).unwrap();
        let nodes = &testnet.nodes;

        // DIRECT
        let samples = 50;
        let mut timings = Vec::with_capacity(samples);
        let mut misses = 0;

        for i in 0..samples {
            let from = &nodes[i % size];
            let to = &nodes[(i + 1) % size];

            let start = Instant::now();
            from.engine
                .send_to_closest_node(Message::request(from.id(), to.id(), Bytes::new()));

            if to.recv_timeout(Duration::from_secs(1)).is_some() {
                timings.push(start.elapsed());
            } else {
                misses += 1;
            }
        }

        println!("direct ({size} nodes, {misses} misses)");
        print_stats(&timings);

        // GROUP
        let samples = 20;
        let mut timings = Vec::with_capacity(samples);

        for i in 0..samples {
            let from = &nodes[i % size];
            let target = nodes[(i + size / 2) % size].id();

            let start = Instant::now();
            from.engine
                .send_to_closest_node(Message::group_request(from.id(), target, Bytes::new()));

            // Wait for the whole close group
            let mut received = 0;
            let deadline = start + Duration::from_secs(1);
            while received < 4 && Instant::now() < deadline {
                received += nodes.iter().map(|n| n.delivered().len()).sum::<usize>();
            }
            timings.push(start.elapsed());
        }

        println!("group ({size} nodes)");
        print_stats(&timings);
    }
}

fn print_stats(timings: &[Duration]) {
    if timings.is_empty() {
        println!("no samples\n");
        return;
    }

    let mut us: Vec<_> = timings.iter().map(|d| d.as_micros()).collect();
    us.sort_unstable();
    let n = us.len();
    let mean = us.iter().sum::<u128>() / n as u128;

    println!(
        "n={n} min={:.2}ms mean={:.2}ms p50={:.2}ms p95={:.2}ms max={:.2}ms\n",
        us[0] as f64 / 1000.0,
        mean as f64 / 1000.0,
        us[n / 2] as f64 / 1000.0,
        us[n * 95 / 100] as f64 / 1000.0,
        us[n - 1] as f64 / 1000.0,
    );
}
