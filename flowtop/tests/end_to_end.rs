//! End-to-end behaviour of the statistics engine without a live capture:
//! frames go through the decoder and `Iface::ingest`, ticks are driven by hand.

use std::{sync::Arc, thread};

use flowtop::{
    Iface, IfaceOptions, Stats,
    decode::{LinkKind, decode_frame},
    model::LocalNetworks,
    snapshot::rank,
};

const ETH_HEADER_LEN: usize = 14;

fn tcp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Vec<u8> {
    let mut frame = vec![0u8; ETH_HEADER_LEN + 20 + 20];
    frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    let ip = &mut frame[ETH_HEADER_LEN..];
    ip[0] = 0x45;
    ip[9] = 6;
    ip[12..16].copy_from_slice(&src);
    ip[16..20].copy_from_slice(&dst);
    ip[20..22].copy_from_slice(&sport.to_be_bytes());
    ip[22..24].copy_from_slice(&dport.to_be_bytes());
    frame
}

fn eth0() -> Stats {
    Stats::new([Iface::new(
        "eth0",
        IfaceOptions {
            local: LocalNetworks::parse("10.0.0.1/32").unwrap(),
            enable_l4: true,
            ..Default::default()
        },
    )])
}

/// Sends `bytes` from 10.0.0.1:5000 to 93.184.216.34:443 in 1250-byte frames.
fn send_second(iface: &Iface, bytes: u64, second: i64) {
    let data = tcp_frame([10, 0, 0, 1], 5000, [93, 184, 216, 34], 443);
    let local = iface.local_networks();
    for _ in 0..bytes / 1_250 {
        let frame = decode_frame(LinkKind::Ethernet, &data, 1_250, second * 1_000, local);
        iface.ingest(&frame);
    }
}

#[test]
fn steady_tcp_flow_over_eight_seconds() {
    let stats = eth0();
    let iface = stats.get("eth0").unwrap();

    for second in 0..8 {
        send_second(iface, 125_000, second);
        stats.tick("eth0", (second + 1) * 1_000).unwrap();
    }

    let l4 = iface.l4_snapshots();
    assert_eq!(l4.len(), 1);
    let flow = &l4[0];
    assert_eq!(flow.protocol, "TCP");
    assert_eq!(flow.source_address, "10.0.0.1:5000");
    assert_eq!(flow.destination_address, "93.184.216.34:443");
    assert_eq!(flow.up_stream_rate1, 1_000_000);
    assert_eq!(flow.down_stream_rate1, 0);
    assert_eq!(flow.up_stream_rate15, 0);
    assert_eq!(flow.up_stream_rate60, 0);

    let (_, record) = iface.l4_table().snapshot().pop().unwrap();
    assert_eq!(record.upload_bytes(), 1_000_000);

    let l3 = iface.l3_snapshots();
    assert_eq!(l3.len(), 1);
    assert_eq!(l3[0].source_address, "10.0.0.1");
    assert_eq!(l3[0].protocol, "IPv4");
}

#[test]
fn windows_warm_up_then_decay_to_idle() {
    let stats = eth0();
    let iface = stats.get("eth0").unwrap();

    for second in 0..60 {
        send_second(iface, 125_000, second);
        stats.tick("eth0", (second + 1) * 1_000).unwrap();
        let flow = &iface.l4_snapshots()[0];
        if second < 14 {
            assert_eq!(flow.up_stream_rate15, 0, "second {second}");
        } else {
            assert_eq!(flow.up_stream_rate15, 1_000_000, "second {second}");
        }
    }
    let flow = &iface.l4_snapshots()[0];
    assert_eq!(flow.up_stream_rate60, 1_000_000);

    // traffic stops: the 1s window drops first, the flow disappears once the
    // 60s window has no delta left
    stats.tick("eth0", 61_000).unwrap();
    let flow = &iface.l4_snapshots()[0];
    assert_eq!(flow.up_stream_rate1, 0);
    assert!(flow.up_stream_rate60 > 0);

    for second in 62..=120 {
        stats.tick("eth0", second * 1_000).unwrap();
    }
    assert!(iface.l4_snapshots().is_empty());
    assert!(iface.l3_snapshots().is_empty());
}

#[test]
fn reply_traffic_is_download_on_the_same_flow() {
    let stats = eth0();
    let iface = stats.get("eth0").unwrap();
    let reply = tcp_frame([93, 184, 216, 34], 443, [10, 0, 0, 1], 5000);

    send_second(iface, 12_500, 0);
    for _ in 0..100 {
        let frame = decode_frame(LinkKind::Ethernet, &reply, 1_250, 0, iface.local_networks());
        iface.ingest(&frame);
    }
    stats.tick("eth0", 1_000).unwrap();

    let l4 = iface.l4_snapshots();
    assert_eq!(l4.len(), 1);
    assert_eq!(l4[0].up_stream_rate1, 100_000);
    assert_eq!(l4[0].down_stream_rate1, 1_000_000);
}

#[test]
fn concurrent_ingestion_loses_no_bytes() {
    const THREADS: usize = 8;
    const FRAMES: usize = 5_000;

    let stats = Arc::new(eth0());
    thread::scope(|s| {
        for t in 0..THREADS {
            let stats = stats.clone();
            s.spawn(move || {
                let iface = stats.get("eth0").unwrap();
                // half the threads share one hot flow, the rest get their own
                let port = if t % 2 == 0 { 5000 } else { 6000 + t as u16 };
                let data = tcp_frame([10, 0, 0, 1], port, [93, 184, 216, 34], 443);
                for _ in 0..FRAMES {
                    let frame = decode_frame(LinkKind::Ethernet, &data, 100, 0, iface.local_networks());
                    iface.ingest(&frame);
                }
            });
        }
    });

    let iface = stats.get("eth0").unwrap();
    let l3_total: u64 = iface
        .l3_table()
        .snapshot()
        .iter()
        .map(|(_, r)| r.upload_bytes())
        .sum();
    assert_eq!(l3_total, (THREADS * FRAMES * 100) as u64);

    let hot = iface
        .l4_table()
        .snapshot()
        .into_iter()
        .find(|(k, _)| k.local_port == 5000)
        .map(|(_, r)| r.upload_bytes());
    assert_eq!(hot, Some((THREADS / 2 * FRAMES * 100) as u64));
    assert_eq!(iface.l4_table().len(), 1 + THREADS / 2);
}

#[test]
fn ranking_is_stable_across_unchanged_ticks() {
    let stats = eth0();
    let iface = stats.get("eth0").unwrap();
    for port in 1..=10u16 {
        let data = tcp_frame([10, 0, 0, 1], port, [93, 184, 216, 34], 443);
        for _ in 0..port {
            let frame = decode_frame(LinkKind::Ethernet, &data, 1_000, 0, iface.local_networks());
            iface.ingest(&frame);
        }
    }
    stats.tick("eth0", 1_000).unwrap();
    let first: Vec<String> = iface
        .l4_snapshots()
        .iter()
        .map(|s| s.source_address.clone())
        .collect();
    assert_eq!(first[0], "10.0.0.1:10");
    assert_eq!(first[9], "10.0.0.1:1");

    // re-rank the same table state without pushing a new sample
    let sampled: Vec<_> = iface
        .l4_table()
        .snapshot()
        .into_iter()
        .map(|(key, record)| (key, record.rates()))
        .collect();
    for _ in 0..2 {
        let again: Vec<String> = rank(&sampled)
            .into_iter()
            .map(|s| s.source_address)
            .collect();
        assert_eq!(first, again);
    }
}
