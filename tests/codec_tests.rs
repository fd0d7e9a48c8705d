use quarry::codec::{
    active_key, claim_key, claims_prefix, counter_key, counter_prefix, crawl_index_key,
    decode_active_key, decode_claim_key, decode_counter_key, decode_crawl_index_key,
    decode_i64_le, decode_queue_key, decode_semaphore_key, decode_ttl_index_key, encode_i64_le,
    queue_key, queue_prefix, range_end, semaphore_key, ttl_index_key, ttl_index_range_until,
    ActiveScope, ClaimRecord, CodecError, CounterKind, QueueJob,
};

#[test]
fn queue_key_roundtrip() {
    let key = queue_key("team-1", 10, 1_700_000_000_000, "job-1");
    let decoded = decode_queue_key(&key).unwrap();
    assert_eq!(decoded.team_id, "team-1");
    assert_eq!(decoded.priority, 10);
    assert_eq!(decoded.created_at, 1_700_000_000_000);
    assert_eq!(decoded.job_id, "job-1");
}

#[test]
fn queue_keys_sort_by_priority_then_time_then_id() {
    // Lower priority value = higher priority = earlier in scan order.
    let high = queue_key("t", 5, 300, "c");
    let older = queue_key("t", 10, 100, "a");
    let newer = queue_key("t", 10, 200, "b");
    assert!(high < older);
    assert!(older < newer);

    // Same priority and time: job id breaks the tie.
    let a = queue_key("t", 10, 100, "a");
    let b = queue_key("t", 10, 100, "b");
    assert!(a < b);
}

#[test]
fn negative_priority_sorts_first() {
    let urgent = queue_key("t", -5, 999, "z");
    let normal = queue_key("t", 0, 1, "a");
    assert!(urgent < normal);
}

#[test]
fn fifo_scan_order_matches_pop_expectation() {
    // Priorities [10, 10, 5] pushed at [t0, t1, t2]: the scan must yield
    // the priority-5 job first, then the two priority-10 jobs in push order.
    let job1 = queue_key("t", 10, 1000, "job-1");
    let job2 = queue_key("t", 10, 1001, "job-2");
    let job3 = queue_key("t", 5, 1002, "job-3");

    let mut keys = vec![job1.clone(), job2.clone(), job3.clone()];
    keys.sort();
    assert_eq!(keys, vec![job3, job1, job2]);
}

#[test]
fn all_team_keys_fall_inside_team_prefix_range() {
    let prefix = queue_prefix("team-1");
    let end = range_end(&prefix);
    for key in [
        queue_key("team-1", i32::MIN, 0, ""),
        queue_key("team-1", i32::MAX, i64::MAX, "zzzz"),
    ] {
        assert!(key.as_slice() >= prefix.as_slice());
        assert!(key.as_slice() < end.as_slice());
    }
    // A different team never lands inside the range.
    let other = queue_key("team-2", 0, 0, "a");
    assert!(other.as_slice() >= end.as_slice() || other.as_slice() < prefix.as_slice());
}

#[test]
fn decode_rejects_wrong_subspace() {
    let key = crawl_index_key("crawl-1", "job-1");
    let err = decode_queue_key(&key).unwrap_err();
    assert!(matches!(err, CodecError::WrongSubspace { .. }));
}

#[test]
fn decode_rejects_truncated_key() {
    let key = queue_key("team-1", 10, 12345, "job-1");
    let err = decode_queue_key(&key[..key.len() - 3]).unwrap_err();
    assert!(matches!(err, CodecError::LengthOverrun { .. }));
}

#[test]
fn decode_rejects_trailing_bytes() {
    let mut key = queue_key("team-1", 10, 12345, "job-1");
    key.push(0x00);
    let err = decode_queue_key(&key).unwrap_err();
    assert!(matches!(err, CodecError::TrailingBytes(1)));
}

#[test]
fn decode_rejects_empty_key() {
    assert!(matches!(decode_queue_key(&[]), Err(CodecError::TooShort(0))));
}

#[test]
fn crawl_index_key_roundtrip() {
    let key = crawl_index_key("crawl-9", "job-7");
    let (crawl_id, job_id) = decode_crawl_index_key(&key).unwrap();
    assert_eq!(crawl_id, "crawl-9");
    assert_eq!(job_id, "job-7");
}

#[test]
fn counter_key_roundtrip_for_all_kinds() {
    for kind in CounterKind::ALL {
        let key = counter_key(kind, "some-id");
        let (decoded_kind, id) = decode_counter_key(&key).unwrap();
        assert_eq!(decoded_kind, kind);
        assert_eq!(id, "some-id");
    }
}

#[test]
fn counter_key_rejects_unknown_kind_tag() {
    let mut key = counter_key(CounterKind::TeamQueue, "id");
    key[1] = 0x77;
    let err = decode_counter_key(&key).unwrap_err();
    assert!(matches!(err, CodecError::UnknownCounterKind(0x77)));
}

#[test]
fn counter_kinds_form_disjoint_ranges() {
    // The stale-counter cursor walks one kind at a time; a crawl counter
    // must never appear under the team prefix.
    let team_prefix = counter_prefix(CounterKind::TeamQueue);
    let team_end = range_end(&team_prefix);
    let crawl = counter_key(CounterKind::CrawlQueue, "x");
    assert!(crawl.as_slice() >= team_end.as_slice());
}

#[test]
fn ttl_index_key_roundtrip_and_ordering() {
    let key = ttl_index_key(5_000, "team-1", "job-1");
    let decoded = decode_ttl_index_key(&key).unwrap();
    assert_eq!(decoded.expires_at, 5_000);
    assert_eq!(decoded.team_id, "team-1");
    assert_eq!(decoded.job_id, "job-1");

    let earlier = ttl_index_key(4_999, "zzz", "zzz");
    assert!(earlier < key);
}

#[test]
fn ttl_range_until_covers_only_expired_entries() {
    let (start, end) = ttl_index_range_until(1_000);
    let expired = ttl_index_key(999, "t", "j");
    let boundary = ttl_index_key(1_000, "t", "j");
    let live = ttl_index_key(1_001, "t", "j");

    assert!(expired.as_slice() >= start.as_slice() && expired.as_slice() < end.as_slice());
    // expires_at == now is not yet expired.
    assert!(boundary.as_slice() >= end.as_slice());
    assert!(live.as_slice() >= end.as_slice());
}

#[test]
fn active_key_roundtrip_per_scope() {
    for scope in [ActiveScope::Team, ActiveScope::Crawl] {
        let key = active_key(scope, "scope-id", "job-1");
        let decoded = decode_active_key(scope, &key).unwrap();
        assert_eq!(decoded.id, "scope-id");
        assert_eq!(decoded.job_id, "job-1");
    }
}

#[test]
fn active_scopes_do_not_alias() {
    let team = active_key(ActiveScope::Team, "x", "j");
    let err = decode_active_key(ActiveScope::Crawl, &team).unwrap_err();
    assert!(matches!(err, CodecError::WrongSubspace { .. }));
}

#[test]
fn claim_key_layout_for_versionstamped_write() {
    let key = claim_key("job-1", "worker-1");
    let prefix = claims_prefix("job-1");
    assert!(key.starts_with(&prefix));

    // Trailing 4 bytes are the little-endian offset of the placeholder,
    // which sits directly after the job id.
    let offset =
        u32::from_le_bytes(key[key.len() - 4..].try_into().unwrap()) as usize;
    assert_eq!(offset, prefix.len());
    assert_eq!(&key[offset..offset + 10], &[0xff; 10]);

    // The worker id follows the placeholder, so two workers' pre-commit
    // keys differ and their writes cannot conflict.
    let other = claim_key("job-1", "worker-2");
    assert_ne!(key, other);
}

#[test]
fn claim_key_decodes_after_commit_rewrite() {
    // Simulate the store's rewrite: placeholder replaced by a real stamp,
    // trailing offset stripped.
    let mut key = claim_key("job-1", "worker-1");
    key.truncate(key.len() - 4);
    let prefix = claims_prefix("job-1");
    let stamp = [7u8; 10];
    key[prefix.len()..prefix.len() + 10].copy_from_slice(&stamp);

    let decoded = decode_claim_key(&key).unwrap();
    assert_eq!(decoded.job_id, "job-1");
    assert_eq!(decoded.versionstamp, stamp);
    assert_eq!(decoded.worker_id, "worker-1");
}

#[test]
fn claims_sort_by_versionstamp_within_a_job() {
    // Post-commit claim keys for the same job must order by versionstamp
    // regardless of worker id, so the first record in the range is the
    // winner.
    let prefix = claims_prefix("job-1");
    let build = |stamp: u8, worker: &str| {
        let mut key = prefix.clone();
        key.extend_from_slice(&[stamp; 10]);
        key.extend_from_slice(&(worker.len() as u32).to_be_bytes());
        key.extend_from_slice(worker.as_bytes());
        key
    };
    let first = build(1, "zzzz-worker");
    let second = build(2, "aaaa-worker");
    assert!(first < second);
}

#[test]
fn randomized_queue_keys_order_like_their_tuples() {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let mut entries: Vec<((i32, i64, String), Vec<u8>)> = (0..500)
        .map(|i| {
            let priority = rng.gen_range(-100..100);
            let created_at = rng.gen_range(0..2_000_000_000_000i64);
            let job_id = format!("job-{i}");
            let key = queue_key("team", priority, created_at, &job_id);
            ((priority, created_at, job_id), key)
        })
        .collect();

    let mut by_tuple = entries.clone();
    by_tuple.sort_by(|a, b| a.0.cmp(&b.0));
    entries.sort_by(|a, b| a.1.cmp(&b.1));

    let tuple_order: Vec<_> = by_tuple.into_iter().map(|(t, _)| t).collect();
    let byte_order: Vec<_> = entries.into_iter().map(|(t, _)| t).collect();
    assert_eq!(
        byte_order, tuple_order,
        "byte order of encoded keys must match (priority, created_at, job_id) order"
    );
}

#[test]
fn semaphore_key_roundtrip() {
    let key = semaphore_key("team-1", "holder-1");
    let decoded = decode_semaphore_key(&key).unwrap();
    assert_eq!(decoded.team_id, "team-1");
    assert_eq!(decoded.holder_id, "holder-1");
}

#[test]
fn counter_value_little_endian_roundtrip() {
    assert_eq!(decode_i64_le(&encode_i64_le(42)), 42);
    assert_eq!(decode_i64_le(&encode_i64_le(-17)), -17);
    // Short buffers read as zero, matching a missing counter.
    assert_eq!(decode_i64_le(&[1, 2, 3]), 0);
}

#[test]
fn queue_job_value_preserves_opaque_payload_bytes() {
    let data: Vec<u8> = (0..=255).collect();
    let job = QueueJob {
        id: "job-1".to_string(),
        team_id: "team-1".to_string(),
        data: data.clone(),
        priority: 3,
        listenable: true,
        listen_channel_id: Some("chan-1".to_string()),
        crawl_id: None,
        created_at: 1_700_000_000_000,
        times_out_at: Some(1_700_000_060_000),
    };
    let encoded = serde_json::to_vec(&job).unwrap();
    let decoded: QueueJob = serde_json::from_slice(&encoded).unwrap();
    assert_eq!(decoded, job);
    assert_eq!(decoded.data, data);
}

#[test]
fn claim_record_roundtrip() {
    let record = ClaimRecord {
        worker_id: "worker-1".to_string(),
        queue_key: queue_key("t", 1, 2, "j"),
        claimed_at: 123,
    };
    let encoded = serde_json::to_vec(&record).unwrap();
    let decoded: ClaimRecord = serde_json::from_slice(&encoded).unwrap();
    assert_eq!(decoded, record);
}
