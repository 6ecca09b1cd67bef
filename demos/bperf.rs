//! Count cycles and instructions system-wide, and optionally in one cgroup.
//!
//! ```text
//! RUST_LOG=bperf=debug cargo run --example bperf -- /sys/fs/cgroup/system.slice
//! ```

use std::env;
use std::thread;
use std::time::Duration;

use bperf::*;

fn main() -> Result<(), bperf::error::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let catalog = GenericCatalog::new();
    let metric = MetricDesc {
        id: "ipc".to_string(),
        brief: "Instructions per cycle".to_string(),
        description: String::new(),
        event_refs: vec![
            EventRef::new("cycles", PmuType::GenericHardware, "cycles"),
            EventRef::new("inst", PmuType::GenericHardware, "instructions"),
        ],
    };

    let map = AttrMap::open(AttrMapConfig::from_env()?)?;
    let mut group = EventGroup::from_metric("ipc", &metric, &catalog, map)?;
    group.open()?;

    let cgroup = match env::args().nth(1) {
        Some(path) => {
            let cgroup = Cgroup::open(path)?;
            group.add_cgroup(&cgroup)?;
            Some(cgroup)
        }
        None => None,
    };

    group.enable()?;

    let mut buf = [CounterReading::default(); MAX_GROUP_SIZE];
    for _ in 0..10 {
        thread::sleep(Duration::from_millis(500));

        let n = group.read_global(&mut buf);
        print_ipc("global", &buf[..n]);

        if let Some(cgroup) = &cgroup {
            let n = group.read_cgroup(&mut buf, cgroup.id());
            print_ipc(&cgroup.path().display().to_string(), &buf[..n]);
        }
    }

    // Freeze what this group reads.
    group.disable()?;
    if let Some(cycles) = group.read_global_vec().first() {
        println!("total cycles: {}", cycles.scaled());
    }

    Ok(())
}

fn print_ipc(scope: &str, values: &[CounterReading]) {
    if values.len() < 2 || values[0].counter == 0 {
        println!("{}: no samples", scope);
        return;
    }
    let ipc = values[1].scaled() as f64 / values[0].scaled() as f64;
    println!(
        "{}: cycles={} instructions={} ipc={:.2}",
        scope, values[0].counter, values[1].counter, ipc
    );
}
