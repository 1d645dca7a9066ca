//! End-to-end pipeline scenarios: FEC through a lossy channel, queue
//! behavior under overload, and a full session loopback over UDP.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use veiltun::fec::{BlockDecoder, BlockEncoder, FecParams};
use veiltun::queue::DeadlineQueue;
use veiltun::{Mode, Role, Session, TunnelConfig};

fn random_payload(rng: &mut StdRng, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rng.fill(buf.as_mut_slice());
    buf
}

#[test]
fn lossless_loopback_1000_blocks() {
    let params = FecParams::new(4, 2, 1024).unwrap();
    let mut rng = StdRng::seed_from_u64(7);

    let mut enc = BlockEncoder::new(params).unwrap();
    let mut dec = BlockDecoder::new(params).unwrap();

    for _ in 0..1000 {
        let payload = random_payload(&mut rng, 4096);
        enc.push(&payload).unwrap();
        let shards = enc.flush().unwrap();

        let mut delivered = None;
        for shard in shards {
            if let Some(block) = dec.push(shard).unwrap() {
                delivered = Some(block);
            }
        }
        assert_eq!(delivered.expect("block must complete"), payload);
    }

    assert_eq!(dec.stats().completed_blocks, 1000);
    assert_eq!(dec.stats().lost_blocks, 0);
}

/// Under independent random loss, every block with at most P missing
/// shards is recovered bit-exactly, and no block ever decodes to wrong
/// bytes. Blocks past the parity budget fail cleanly.
#[test]
fn random_loss_recovers_exactly_the_parity_budget() {
    let params = FecParams::new(8, 2, 1200).unwrap();
    let mut rng = StdRng::seed_from_u64(42);

    let mut enc = BlockEncoder::new(params).unwrap();
    let mut dec = BlockDecoder::new(params).unwrap();

    let mut recoverable = 0u32;
    let mut recovered = 0u32;

    for _ in 0..1000 {
        let payload = random_payload(&mut rng, 8 * 1200);
        enc.push(&payload).unwrap();
        let shards = enc.flush().unwrap();

        let kept: Vec<_> = shards
            .into_iter()
            .filter(|_| rng.gen::<f64>() >= 0.20)
            .collect();
        let expect_recovery = kept.len() >= 8;
        if expect_recovery {
            recoverable += 1;
        }

        let mut delivered = None;
        for shard in kept {
            if let Some(block) = dec.push(shard).unwrap() {
                delivered = Some(block);
            }
        }

        match delivered {
            Some(block) => {
                assert!(expect_recovery, "under-provisioned block must not decode");
                assert_eq!(block, payload, "recovered block must be bit-exact");
                recovered += 1;
            }
            None => assert!(!expect_recovery, "block with >=D shards must decode"),
        }
    }

    assert_eq!(recovered, recoverable);
    // Sanity: with 20% i.i.d. loss a meaningful share of blocks survives.
    assert!(recovered > 500, "recovered only {} blocks", recovered);
}

/// At a realistic 2% loss rate the 8+2 geometry recovers nearly all
/// blocks.
#[test]
fn light_loss_recovery_rate() {
    let params = FecParams::new(8, 2, 1200).unwrap();
    let mut rng = StdRng::seed_from_u64(1234);

    let mut enc = BlockEncoder::new(params).unwrap();
    let mut dec = BlockDecoder::new(params).unwrap();

    let mut recovered = 0u32;
    for _ in 0..1000 {
        let payload = random_payload(&mut rng, 8 * 1200);
        enc.push(&payload).unwrap();
        let shards = enc.flush().unwrap();

        let kept: Vec<_> = shards
            .into_iter()
            .filter(|_| rng.gen::<f64>() >= 0.02)
            .collect();

        for shard in kept {
            if let Some(block) = dec.push(shard).unwrap() {
                assert_eq!(block, payload);
                recovered += 1;
            }
        }
    }

    assert!(
        recovered >= 950,
        "recovered {} of 1000 blocks at 2% loss",
        recovered
    );
}

#[test]
fn burst_loss_within_parity_always_recovers() {
    let params = FecParams::new(8, 2, 256).unwrap();
    let mut rng = StdRng::seed_from_u64(99);

    let mut enc = BlockEncoder::new(params).unwrap();
    let mut dec = BlockDecoder::new(params).unwrap();

    for round in 0..100 {
        let payload = random_payload(&mut rng, 8 * 256);
        enc.push(&payload).unwrap();
        let shards = enc.flush().unwrap();

        // Drop two consecutive shards, rotating the burst position.
        let first = round % 9;
        let kept: Vec<_> = shards
            .into_iter()
            .filter(|s| s.index as usize != first && s.index as usize != first + 1)
            .collect();

        let mut delivered = None;
        for shard in kept {
            if let Some(block) = dec.push(shard).unwrap() {
                delivered = Some(block);
            }
        }
        assert_eq!(delivered.expect("burst within parity"), payload);
    }
}

/// Overload: a producer far faster than the consumer. Depth must stay
/// bounded by capacity and no entry may be delivered past its deadline.
#[tokio::test(flavor = "multi_thread")]
async fn queue_overload_stays_bounded() {
    const CAPACITY: usize = 500;
    let queue = Arc::new(DeadlineQueue::with_capacity(CAPACITY));
    let start = Instant::now();

    let producer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            // ~10k entries/s for one second.
            for _ in 0..100 {
                for _ in 0..100 {
                    let nanos = (start.elapsed().as_nanos() as u64).to_be_bytes();
                    let _ = queue.push(Bytes::copy_from_slice(&nanos));
                }
                assert!(queue.depth() <= CAPACITY);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            queue.close();
        })
    };

    let consumer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut max_sojourn = Duration::ZERO;
            let mut consumed = 0u32;
            // ~1k entries/s.
            while let Some(entry) = queue.pop().await {
                let sent = u64::from_be_bytes(entry.as_ref().try_into().unwrap());
                let sojourn = start.elapsed() - Duration::from_nanos(sent);
                max_sojourn = max_sojourn.max(sojourn);
                consumed += 1;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            (consumed, max_sojourn)
        })
    };

    producer.await.unwrap();
    let (consumed, max_sojourn) = consumer.await.unwrap();

    assert!(consumed > 0);
    // 200ms deadline plus scheduling slack.
    assert!(
        max_sojourn <= Duration::from_millis(300),
        "max sojourn {:?}",
        max_sojourn
    );
}

fn fake_ipv4_packet(seq: u8, len: usize) -> Bytes {
    assert!(len >= 20);
    let mut packet = vec![0u8; len];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&[10, 0, 0, 1]);
    packet[16..20].copy_from_slice(&[10, 0, 0, 2]);
    for (i, byte) in packet.iter_mut().enumerate().skip(20) {
        *byte = seq.wrapping_add(i as u8);
    }
    Bytes::from(packet)
}

fn udp_config(role: Role, local: SocketAddrV4, remote: Option<SocketAddrV4>) -> TunnelConfig {
    TunnelConfig {
        role,
        mode: Mode::Udp,
        local_addr: local,
        remote_addr: remote,
        key: "pipeline test key".into(),
        send_queue_size: 500,
        recv_queue_size: 500,
        mtu: 1200,
        fec_data: 4,
        fec_parity: 2,
        faketcp_pacing_us: 50,
        faketcp_max_segment: 1371,
        idle_timeout_s: 60,
    }
}

/// Full data plane over UDP loopback: queues, FEC, cipher, pacing.
#[tokio::test(flavor = "multi_thread")]
async fn session_loopback_over_udp() {
    let localhost = Ipv4Addr::LOCALHOST;

    // Bind the server on an ephemeral port first so the client knows
    // where to aim.
    let probe = std::net::UdpSocket::bind((localhost, 0)).unwrap();
    let server_port = probe.local_addr().unwrap().port();
    drop(probe);

    let server_addr = SocketAddrV4::new(localhost, server_port);
    let server = Session::serve(udp_config(Role::Server, server_addr, None))
        .await
        .unwrap();

    let client = Session::connect(udp_config(
        Role::Client,
        SocketAddrV4::new(localhost, 0),
        Some(server_addr),
    ))
    .await
    .unwrap();

    let sent: Vec<Bytes> = (0..20).map(|i| fake_ipv4_packet(i, 120)).collect();
    for packet in &sent {
        client.send(packet.clone()).unwrap();
    }

    let mut received = Vec::new();
    while received.len() < sent.len() {
        match tokio::time::timeout(Duration::from_secs(5), server.recv()).await {
            Ok(Some(packet)) => received.push(packet),
            Ok(None) => panic!("server session closed early"),
            Err(_) => panic!("timed out after {} packets", received.len()),
        }
    }
    assert_eq!(received, sent);

    // Reverse direction: the server learned the client's address.
    let reply = fake_ipv4_packet(0xAA, 200);
    server.send(reply.clone()).unwrap();

    let got = tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("reply within deadline")
        .expect("client session open");
    assert_eq!(got, reply);

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}
