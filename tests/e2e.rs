//! End-to-end tests of the round kernel.
//!
//! A four-node cluster runs over the in-process channel transport and a
//! manual clock. Each test drives signing and message delivery by hand:
//! - **Finalization**: quorum co-signing, topological order, gossip
//! - **Rounds**: rotation, references, round gossip, restart
//! - **Admission**: deposits, double spends, replays

mod common;

use std::sync::Arc;

use common::{deposit, mint, test_config, Cluster, GAP, GENESIS};
use meridian::consensus::{ConsensusNode, FinalRound, Snapshot, SnapshotWithTopologicalOrder};
use meridian::crypto::keys::SigningKeypair;
use meridian::network::{ChannelTransport, Message, SnapshotMode};
use meridian::node::{Clock, KernelError, ManualClock, Node};
use meridian::storage::{RoundStore, SledStore};

// ── Finalization ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_mint_finalizes_on_every_node() {
    let mut cluster = Cluster::new(4);
    let s = cluster.finalize(0, mint(1, 100)).await;

    let own = cluster.nodes[0].store().read_snapshot(&s.hash).unwrap().unwrap();
    assert_eq!(own.topological_order, 0);
    // Author plus two co-signers; the last co-signature arrives after quorum.
    assert_eq!(own.snapshot.signatures.len(), 3);
    assert_eq!(cluster.nodes[0].pending_count().await, 0);

    for node in &cluster.nodes {
        let stored = node.store().read_snapshot(&s.hash).unwrap().unwrap();
        assert_eq!(stored.topological_order, 0);
        assert!(node.store().check_transaction_finalization(&s.transaction).unwrap());
        assert_eq!(node.topology(), 1);
    }
}

#[tokio::test]
async fn test_topological_order_is_gapless() {
    let mut cluster = Cluster::new(4);
    let mut hashes = Vec::new();
    for batch in 1..=3 {
        hashes.push(cluster.finalize(0, mint(batch, 10 * batch)).await.hash);
    }
    for node in &cluster.nodes {
        let orders: Vec<u64> = hashes
            .iter()
            .map(|h| node.store().read_snapshot(h).unwrap().unwrap().topological_order)
            .collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }
    assert_eq!(cluster.nodes[0].cache_round().await.snapshots.len(), 3);
}

#[tokio::test]
async fn test_authors_share_one_order_space() {
    let mut cluster = Cluster::new(4);
    let a = cluster.finalize(0, mint(1, 5)).await;
    let b = cluster.finalize(1, mint(2, 6)).await;

    for node in &cluster.nodes {
        let oa = node.store().read_snapshot(&a.hash).unwrap().unwrap();
        let ob = node.store().read_snapshot(&b.hash).unwrap().unwrap();
        assert_ne!(oa.topological_order, ob.topological_order);
        assert_eq!(node.topology(), 2);
    }
    assert_eq!(cluster.nodes[1].cache_round().await.snapshots.len(), 1);
}

#[tokio::test]
async fn test_repeated_cosignature_finalizes_once() {
    let mut cluster = Cluster::new(4);
    let s = cluster.finalize(0, mint(1, 100)).await;

    let mut replay = s.clone();
    replay.signatures = vec![cluster.keypairs[1].sign(&s.hash)];
    cluster.nodes[0]
        .handle_message(
            cluster.ids[1],
            Message::Snapshot {
                snapshot: replay,
                mode: SnapshotMode::Signing,
            },
        )
        .await
        .unwrap();
    cluster.pump().await;

    for node in &cluster.nodes {
        assert_eq!(node.topology(), 1);
    }
}

#[tokio::test]
async fn test_forged_cosignature_rejected() {
    let mut cluster = Cluster::new(4);
    cluster.nodes[0].submit_transaction(mint(1, 100)).unwrap();
    cluster.sign(0).await;

    // Intercept the signing request instead of delivering it.
    let mut request = None;
    while let Ok(envelope) = cluster.inboxes[1].try_recv() {
        if let Some(Message::Snapshot { snapshot, .. }) = envelope.decode() {
            request = Some(snapshot);
        }
    }
    let mut forged = request.expect("signing request sent to peer");
    forged.signatures = vec![SigningKeypair::generate().sign(&forged.hash)];

    let err = cluster.nodes[0]
        .handle_message(
            cluster.ids[1],
            Message::Snapshot {
                snapshot: forged,
                mode: SnapshotMode::Signing,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::InvalidSignature(id) if id == cluster.ids[1]));
    assert_eq!(cluster.nodes[0].pending_count().await, 1);
    assert_eq!(cluster.nodes[0].topology(), 0);
}

#[tokio::test]
async fn test_finalized_gossip_requires_quorum() {
    let cluster = Cluster::new(4);
    let tx = mint(1, 100);
    let store = cluster.nodes[3].store();
    store.cache_put_transaction(&tx).unwrap();

    let mut s = Snapshot::new(cluster.ids[1], tx.hash());
    s.round_number = 1;
    s.timestamp = GENESIS + GAP;
    s.hash = s.payload_hash();
    let gossip = |signers: &[usize]| Message::Snapshot {
        snapshot: Snapshot {
            signatures: signers
                .iter()
                .map(|i| cluster.keypairs[*i].sign(&s.hash))
                .collect(),
            ..s.clone()
        },
        mode: SnapshotMode::Finalized,
    };

    cluster.nodes[3]
        .handle_message(cluster.ids[1], gossip(&[1, 2]))
        .await
        .unwrap();
    assert!(store.read_snapshot(&s.hash).unwrap().is_none());

    cluster.nodes[3]
        .handle_message(cluster.ids[1], gossip(&[1, 2, 0]))
        .await
        .unwrap();
    let stored = store.read_snapshot(&s.hash).unwrap().unwrap();
    assert_eq!(stored.topological_order, 0);
    assert!(store.read_transaction(&tx.hash()).unwrap().is_some());
    assert!(store.cache_get_transaction(&tx.hash()).unwrap().is_none());
    assert!(store.check_transaction_finalization(&tx.hash()).unwrap());
}

// ── Rounds ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_first_round_references_genesis() {
    let cluster = Cluster::new(4);
    let round = cluster.nodes[0].cache_round().await;
    assert_eq!(round.number, 1);

    let lowest_peer = cluster.ids[1..].iter().copied().min().unwrap();
    assert_eq!(
        round.references.self_ref,
        FinalRound::genesis(cluster.ids[0], GENESIS).hash
    );
    assert_eq!(
        round.references.external,
        FinalRound::genesis(lowest_peer, GENESIS).hash
    );
}

#[tokio::test]
async fn test_round_rotates_after_gap() {
    let mut cluster = Cluster::new(4);
    let first = cluster.finalize(0, mint(1, 100)).await;
    assert_eq!(first.round_number, 1);

    cluster.clock.advance(GAP);
    let second = cluster.finalize(0, mint(2, 100)).await;
    assert_eq!(second.round_number, 2);

    let closed = cluster.nodes[0].final_round(&cluster.ids[0]).await.unwrap();
    assert_eq!(closed.number, 1);
    assert_eq!(closed.start, first.timestamp);
    assert_eq!(second.references.self_ref, closed.hash);

    // Only genesis rounds are known from peers; the lowest id wins the tie.
    let lowest_peer = cluster.ids[1..].iter().copied().min().unwrap();
    assert_eq!(
        second.references.external,
        FinalRound::genesis(lowest_peer, GENESIS).hash
    );

    for node in &cluster.nodes[1..] {
        assert_eq!(node.final_round(&cluster.ids[0]).await, Some(closed.clone()));
    }
}

#[tokio::test]
async fn test_rotation_references_closed_peer_round() {
    let mut cluster = Cluster::new(4);
    cluster.finalize(1, mint(1, 100)).await;
    cluster.clock.advance(GAP);
    cluster.finalize(1, mint(2, 100)).await;
    let peer_round = cluster.nodes[0].final_round(&cluster.ids[1]).await.unwrap();
    assert_eq!(peer_round.number, 1);

    cluster.finalize(0, mint(3, 100)).await;
    cluster.clock.advance(GAP);
    let s = cluster.finalize(0, mint(4, 100)).await;
    assert_eq!(s.round_number, 2);
    // Node 1 has the deepest history and the latest start.
    assert_eq!(s.references.external, peer_round.hash);
}

#[tokio::test]
async fn test_out_of_order_peer_round_rejected() {
    let cluster = Cluster::new(4);
    let peer = cluster.ids[1];
    let round = |number: u64| FinalRound {
        node_id: peer,
        number,
        start: GENESIS + number * GAP,
        hash: [number as u8; 32],
    };

    cluster.nodes[0]
        .handle_message(peer, Message::FinalRound(round(2)))
        .await
        .unwrap();
    assert_eq!(cluster.nodes[0].final_round(&peer).await.unwrap().number, 0);

    for number in [1, 2] {
        cluster.nodes[0]
            .handle_message(peer, Message::FinalRound(round(number)))
            .await
            .unwrap();
    }
    assert_eq!(cluster.nodes[0].final_round(&peer).await.unwrap(), round(2));
}

#[tokio::test]
async fn test_third_round_snapshot_finalizes_after_prior() {
    let mut cluster = Cluster::new(4);
    cluster.finalize(0, mint(1, 100)).await;
    cluster.clock.advance(GAP);
    cluster.finalize(0, mint(2, 100)).await;
    cluster.clock.advance(GAP);

    let prior = cluster.nodes[0].topology();
    let s = cluster.finalize(0, mint(3, 100)).await;
    assert_eq!(s.round_number, 3);

    let closed = cluster.nodes[0].final_round(&cluster.ids[0]).await.unwrap();
    assert_eq!(closed.number, 2);
    assert_eq!(s.references.self_ref, closed.hash);

    for node in &cluster.nodes {
        let stored = node.store().read_snapshot(&s.hash).unwrap().unwrap();
        assert_eq!(stored.topological_order, prior);
        assert!(stored.snapshot.signatures.len() >= 3);
        assert_eq!(node.topology(), prior + 1);
    }
}

#[tokio::test]
async fn test_rotation_requeues_pending_snapshots() {
    let mut cluster = Cluster::new(4);
    cluster.finalize(0, mint(1, 100)).await;

    let stale_tx = cluster.nodes[0].submit_transaction(mint(2, 100)).unwrap();
    cluster.sign(0).await;
    for inbox in cluster.inboxes.iter_mut() {
        while inbox.try_recv().is_ok() {}
    }
    assert_eq!(cluster.nodes[0].pending_count().await, 1);

    cluster.clock.advance(GAP);
    cluster.nodes[0].submit_transaction(mint(3, 100)).unwrap();
    let mut queued = cluster.drain_queue(0);
    assert_eq!(queued.len(), 1);
    cluster.nodes[0]
        .sign_self_snapshot(queued.remove(0))
        .await
        .unwrap();
    assert_eq!(cluster.nodes[0].cache_round().await.number, 2);

    let requeued = cluster.drain_queue(0);
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].transaction.hash(), stale_tx);
    assert!(requeued[0].snapshot.is_unsigned_shell());
    assert_eq!(cluster.nodes[0].pending_count().await, 1);
}

#[tokio::test]
async fn test_empty_round_never_rotates() {
    let mut cluster = Cluster::new(4);
    cluster.clock.advance(10 * GAP);
    let s = cluster.finalize(0, mint(1, 100)).await;
    assert_eq!(s.round_number, 1);
    let closed = cluster.nodes[0].final_round(&cluster.ids[0]).await.unwrap();
    assert_eq!(closed.number, 0);
}

#[tokio::test]
async fn test_timestamps_strictly_increase() {
    let mut cluster = Cluster::new(4);
    let mut last = 0;
    for batch in 1..=4 {
        let s = cluster.finalize(0, mint(batch, 1)).await;
        assert!(s.timestamp > last);
        last = s.timestamp;
    }
}

#[tokio::test]
async fn test_restart_restores_round_and_order() {
    let dirs: Vec<tempfile::TempDir> = (0..4).map(|_| tempfile::tempdir().unwrap()).collect();
    let keypairs: Vec<SigningKeypair> = (0..4).map(|_| SigningKeypair::generate()).collect();
    let open = |dirs: &[tempfile::TempDir]| -> Vec<Arc<SledStore>> {
        dirs.iter()
            .map(|d| Arc::new(SledStore::open(d.path()).unwrap()))
            .collect()
    };

    let (hash, references) = {
        let mut cluster = Cluster::with_stores(keypairs.clone(), open(&dirs), test_config());
        let s = cluster.finalize(0, mint(1, 100)).await;
        cluster.clock.advance(GAP);
        let s = cluster.finalize(0, mint(2, 100)).await;
        cluster.nodes[0].store().flush().unwrap();
        (s.hash, s.references)
    };

    let cluster = Cluster::with_stores(keypairs, open(&dirs), test_config());
    let round = cluster.nodes[0].cache_round().await;
    assert_eq!(round.number, 2);
    assert_eq!(round.references, references);
    assert_eq!(round.snapshots.len(), 1);
    assert_eq!(round.snapshots[0].hash, hash);
    assert_eq!(cluster.nodes[0].topology(), 2);
    let closed = cluster.nodes[0].final_round(&cluster.ids[0]).await.unwrap();
    assert_eq!(closed.number, 1);
    assert_eq!(closed.hash, references.self_ref);
}

#[tokio::test]
async fn test_restart_rejects_snapshot_outside_its_round() {
    let keypair = SigningKeypair::generate();
    let consensus: Vec<ConsensusNode> = std::iter::once(keypair.clone())
        .chain((0..3).map(|_| SigningKeypair::generate()))
        .map(|kp| ConsensusNode::new(kp.public))
        .collect();
    let ids: Vec<_> = consensus.iter().map(|n| n.id).collect();
    let store = Arc::new(SledStore::open_temporary().unwrap());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(GENESIS + GAP));
    let boot = |mut mesh: Vec<_>| {
        let (transport, _inbox) = mesh.remove(0);
        Node::new(
            keypair.clone(),
            consensus.clone(),
            test_config(),
            store.clone(),
            transport,
            clock.clone(),
        )
    };

    // First boot opens round 1 on the genesis references
    boot(ChannelTransport::mesh(&ids)).unwrap();

    // Filed under round 1 without round 1's references
    let mut s = Snapshot::new(ids[0], mint(1, 100).hash());
    s.round_number = 1;
    s.timestamp = GENESIS + GAP;
    s.hash = s.payload_hash();
    store
        .write_snapshot(&SnapshotWithTopologicalOrder {
            snapshot: s,
            topological_order: 0,
        })
        .unwrap();

    match boot(ChannelTransport::mesh(&ids)) {
        Err(KernelError::Invariant(_)) => {}
        Err(e) => panic!("expected invariant violation, got {}", e),
        Ok(_) => panic!("restore accepted a snapshot outside its round"),
    }
}

// ── Admission ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_deposit_finalizes() {
    let mut cluster = Cluster::new(4);
    let domain = SigningKeypair::generate();
    cluster.add_domain(&domain);

    let s = cluster.finalize(2, deposit(&domain, 0, [5u8; 32])).await;
    for node in &cluster.nodes {
        assert!(node.store().check_transaction_finalization(&s.transaction).unwrap());
    }
}

#[tokio::test]
async fn test_deposit_without_domain_is_not_cosigned() {
    let mut cluster = Cluster::new(4);
    let domain = SigningKeypair::generate();
    // Only the author knows the domain key.
    cluster.nodes[0]
        .store()
        .put_domain(&meridian::storage::Domain {
            public_spend_key: domain.public.clone(),
        })
        .unwrap();

    cluster.nodes[0]
        .submit_transaction(deposit(&domain, 0, [5u8; 32]))
        .unwrap();
    cluster.sign(0).await;
    cluster.pump().await;

    assert_eq!(cluster.nodes[0].pending_count().await, 1);
    assert_eq!(cluster.nodes[0].topology(), 0);
}

#[tokio::test]
async fn test_double_deposit_rejected() {
    let mut cluster = Cluster::new(4);
    let domain = SigningKeypair::generate();
    cluster.add_domain(&domain);

    cluster.finalize(0, deposit(&domain, 0, [5u8; 32])).await;
    let err = cluster.nodes[0]
        .submit_transaction(deposit(&domain, 0, [6u8; 32]))
        .unwrap_err();
    assert!(matches!(err, KernelError::Lock(_)));

    // Same deposit claimed by another author is refused by its own store.
    let err = cluster.nodes[1]
        .submit_transaction(deposit(&domain, 0, [7u8; 32]))
        .unwrap_err();
    assert!(matches!(err, KernelError::Lock(_)));
}

#[tokio::test]
async fn test_finalized_transaction_not_admitted_again() {
    let mut cluster = Cluster::new(4);
    let s = cluster.finalize(0, mint(1, 100)).await;
    for node in &cluster.nodes[1..] {
        assert!(node.check_cache_snapshot_transaction(&s).unwrap().is_none());
    }
}

#[tokio::test]
async fn test_admission_lock_conflict_is_an_error() {
    let cluster = Cluster::new(4);
    let domain = SigningKeypair::generate();
    cluster.add_domain(&domain);
    cluster.nodes[1]
        .submit_transaction(deposit(&domain, 0, [7u8; 32]))
        .unwrap();

    // Node 0 claims the same deposit for another recipient
    let rival = deposit(&domain, 0, [8u8; 32]);
    let store = cluster.nodes[1].store();
    store.cache_put_transaction(&rival).unwrap();
    let mut s = Snapshot::new(cluster.ids[0], rival.hash());
    s.round_number = 1;
    s.timestamp = GENESIS + GAP;
    s.hash = s.payload_hash();

    let err = cluster.nodes[1]
        .check_cache_snapshot_transaction(&s)
        .unwrap_err();
    assert!(matches!(err, KernelError::Lock(_)));
    assert!(store.read_transaction(&rival.hash()).unwrap().is_none());
}

#[tokio::test]
async fn test_transaction_finalized_elsewhere_not_admitted() {
    let cluster = Cluster::new(4);
    let tx = mint(1, 100);
    let store = cluster.nodes[3].store();
    store.cache_put_transaction(&tx).unwrap();

    // Finalized in a snapshot of node 1
    let mut finalized = Snapshot::new(cluster.ids[1], tx.hash());
    finalized.round_number = 1;
    finalized.timestamp = GENESIS + GAP;
    finalized.hash = finalized.payload_hash();
    store
        .write_snapshot(&SnapshotWithTopologicalOrder {
            snapshot: finalized,
            topological_order: 0,
        })
        .unwrap();

    // Node 2 proposes the same transaction
    let mut s = Snapshot::new(cluster.ids[2], tx.hash());
    s.round_number = 1;
    s.timestamp = GENESIS + GAP + 1;
    s.hash = s.payload_hash();
    assert!(cluster.nodes[3]
        .check_cache_snapshot_transaction(&s)
        .unwrap()
        .is_none());

    assert!(store.read_transaction(&tx.hash()).unwrap().is_none());
    let input = tx.transaction.inputs[0].lock_key();
    store.lock_input(&input, &[9u8; 32], false).unwrap();
}

#[tokio::test]
async fn test_invalid_mint_rejected_at_submit() {
    let cluster = Cluster::new(4);
    let mut tx = mint(1, 100);
    tx.transaction.outputs[0].amount = 99;
    let err = cluster.nodes[0].submit_transaction(tx).unwrap_err();
    assert!(matches!(err, KernelError::Rejected(_)));
}

#[tokio::test]
async fn test_messages_from_strangers_dropped() {
    let cluster = Cluster::new(4);
    let stranger = SigningKeypair::generate().public.fingerprint();
    let tx = mint(1, 100);
    cluster.nodes[0]
        .handle_message(stranger, Message::Transaction(tx.clone()))
        .await
        .unwrap();
    assert!(cluster.nodes[0]
        .store()
        .cache_get_transaction(&tx.hash())
        .unwrap()
        .is_none());
}
