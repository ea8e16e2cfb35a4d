//! Smoke test printing where allocations land. Run with
//! `cargo run --example smoke` to also see the allocator's trace output.

use std::io::Write;

use heapmalloc::MemAlloc;

static HEAP: MemAlloc = MemAlloc::new();

/// Logger writing every record to stderr.
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        if cfg!(debug_assertions) {
            true
        } else {
            metadata.level() <= log::Level::Info
        }
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(std::io::stderr().lock(), "[{:5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging() {
    log::set_logger(&LOGGER).expect("Failed to set logger");
    log::set_max_level(if cfg!(debug_assertions) {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    });
}

fn main() {
    init_logging();

    if let Err(err) = HEAP.init(1024) {
        eprintln!("Heap initialization failed: {err}");
        std::process::exit(1);
    }

    println!("Testing basic allocations...");

    let a = HEAP.allocate(128).expect("128 bytes");
    println!("Allocated 128 bytes at {:p}", a);
    let b = HEAP.allocate(64).expect("64 bytes");
    println!("Allocated 64 bytes at {:p}", b);
    let c = HEAP.allocate(32).expect("32 bytes");
    println!("Allocated 32 bytes at {:p}", c);

    unsafe { HEAP.free(a.as_ptr()) };
    println!("Freed block at {:p}", a);

    let d = HEAP.allocate(128).expect("128 bytes");
    println!("Allocated 128 bytes at {:p}", d);

    let e = HEAP.allocate(4096).expect("heap growth");
    println!("Allocated 4096 bytes at {:p} (heap grew)", e);

    unsafe {
        HEAP.free(b.as_ptr());
        HEAP.free(c.as_ptr());
        HEAP.free(d.as_ptr());
        HEAP.free(e.as_ptr());
    }

    println!("{:?}", HEAP.stats());

    HEAP.cleanup();
}
