// Benchmarks for the job state machine and the print buffer hot path.
// Run with: cargo bench

use criterion::{Criterion, criterion_group, criterion_main};
use dispatch_rs::host::print_buffer::{Popped, PrintBuffer};
use dispatch_rs::shared::gcode_utils::parse_gcode_line;
use dispatch_rs::shared::job::{Job, JobEvent, JobKind, JobState, next_state};
use dispatch_rs::shared::Position;
use serde_json::json;

fn bench_job_transitions(c: &mut Criterion) {
    let events = [
        JobEvent::Start,
        JobEvent::Heartbeat,
        JobEvent::Pause,
        JobEvent::Unpause,
        JobEvent::End,
    ];
    c.bench_function("next_state over a full lifecycle", |b| {
        b.iter(|| {
            let mut state = JobState::Pending;
            for event in events {
                if let Some((next, _)) = next_state(state, event) {
                    state = next;
                }
            }
            assert_eq!(state, JobState::Stopped);
        });
    });

    c.bench_function("job with 1k heartbeats", |b| {
        b.iter(|| {
            let job = Job::new(1, "bench", JobKind::Print).with_pausable(true);
            job.add_callback(Box::new(|_, _| Ok(())));
            job.start().unwrap();
            for percent in 0..1000u32 {
                job.heartbeat(json!({ "percent": percent / 10 })).unwrap();
            }
            job.end(json!({ "percent": 100 })).unwrap();
        });
    });
}

fn bench_print_buffer(c: &mut Criterion) {
    let lines: Vec<String> = (0..10_000).map(|i| format!("G1 X{} Y{} F1500", i % 200, i % 150)).collect();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let buffer = PrintBuffer::new();
    c.bench_function("load and drain 10k lines", |b| {
        b.iter(|| {
            rt.block_on(buffer.load(lines.clone()));
            let mut position = Position::default();
            let mut count = 0;
            while let Popped::Line(line) = buffer.try_pop() {
                position = parse_gcode_line(&line.text, &position);
                buffer.mark_sent(&line);
                count += 1;
            }
            std::hint::black_box(position);
            assert_eq!(count, 10_000);
            assert_eq!(buffer.percent(), 100);
        });
    });
}

criterion_group!(benches, bench_job_transitions, bench_print_buffer);
criterion_main!(benches);
