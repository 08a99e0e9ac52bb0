use std::hint::black_box;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion};
use tokio::sync::mpsc;

use rollcall_sync::broadcast::{ConnectionHandle, ConnectionRegistry};
use rollcall_sync::crypto::PayloadCipher;
use rollcall_sync::model::{AttendanceRecord, Payload, PayloadMode, Roster};
use rollcall_sync::protocol::{self, ClientMessage, ServerMessage, MAX_MESSAGE_BYTES};
use rollcall_sync::rate_limit::{Fingerprint, RateLimitConfig, RateLimiter};
use rollcall_sync::validate::Validator;

fn sample_roster(n: usize) -> Roster {
    (0..n)
        .map(|i| {
            let mut rec = AttendanceRecord::new(format!("E{i:04}"), format!("Employee {i}"));
            rec.group = Some(format!("Team {}", i % 8));
            rec.attending = i % 3 != 0;
            rec
        })
        .collect()
}

fn bench_parse_validate_save_200(c: &mut Criterion) {
    let raw = ClientMessage::Save(Payload::Plain(sample_roster(200)))
        .encode()
        .unwrap();
    let validator = Validator::new(PayloadMode::Plain);

    c.bench_function("parse_validate_save_200_records", |b| {
        b.iter(|| {
            let value = protocol::parse_frame(black_box(raw.as_bytes()), MAX_MESSAGE_BYTES).unwrap();
            black_box(validator.validate(value).unwrap());
        })
    });
}

fn bench_encode_attendees_200(c: &mut Criterion) {
    let msg = ServerMessage::Attendees(Payload::Plain(sample_roster(200)));

    c.bench_function("encode_attendees_200_records", |b| {
        b.iter(|| black_box(msg.encode().unwrap()))
    });
}

fn bench_rate_limiter_check(c: &mut Criterion) {
    let limiter = RateLimiter::new(RateLimitConfig {
        capacity: u32::MAX,
        ..RateLimitConfig::default()
    });
    let fingerprints: Vec<Fingerprint> = (0..1000u32)
        .map(|i| Fingerprint::derive(IpAddr::V4(Ipv4Addr::from(i)), "bench"))
        .collect();

    c.bench_function("rate_limiter_check_1000_fingerprints", |b| {
        b.iter(|| {
            let now = Instant::now();
            for fp in &fingerprints {
                black_box(limiter.check(*fp, now));
            }
        })
    });
}

fn bench_broadcast_100_connections(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = ConnectionRegistry::new();
    let mut receivers = Vec::new();
    rt.block_on(async {
        for i in 0..100u16 {
            let (tx, rx) = mpsc::channel(1);
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 10_000 + i);
            let fp = Fingerprint::derive(addr.ip(), "bench");
            registry.register(ConnectionHandle::new(addr, fp, tx)).await;
            receivers.push(rx);
        }
    });
    let msg = ServerMessage::Attendees(Payload::Plain(sample_roster(50)));

    c.bench_function("broadcast_100_connections", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(registry.broadcast(&msg).await.unwrap());
            });
            for rx in receivers.iter_mut() {
                let _ = rx.try_recv();
            }
        })
    });
}

fn bench_seal_open_roster_100(c: &mut Criterion) {
    let cipher = PayloadCipher::new("bench-secret").unwrap();
    let roster = sample_roster(100);

    c.bench_function("seal_open_roster_100_records", |b| {
        b.iter(|| {
            let sealed = cipher.seal_roster(black_box(&roster)).unwrap();
            black_box(cipher.open_roster(&sealed).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_parse_validate_save_200,
    bench_encode_attendees_200,
    bench_rate_limiter_check,
    bench_broadcast_100_connections,
    bench_seal_open_roster_100,
);
criterion_main!(benches);
