//! Pessimistic and optimistic transaction behaviour across sessions

mod common;

use common::{TestKit, must_exec, must_fail, must_query, row};
use pessimist_common::{Key, Timestamp};
use pessimist_txn::{Assignment, Config, ErrorCode, Filter, Statement, TxnMode};
use std::collections::HashSet;
use std::time::Duration;

fn set_v(value: i64) -> Vec<Assignment> {
    vec![Assignment::set("v", value)]
}

fn incr_v() -> Vec<Assignment> {
    vec![Assignment::add("v", 1)]
}

#[tokio::test]
async fn test_pessimistic_txn() {
    let kit = TestKit::new();
    let mut tk = kit.session();
    let mut tk1 = kit.session();

    must_exec(&mut tk, Statement::create_table("pessimistic", &["k", "v"], None)).await;
    must_exec(&mut tk, Statement::insert("pessimistic", vec![row(&[1, 1])])).await;

    must_exec(&mut tk1, Statement::begin_pessimistic()).await;
    assert!(tk1.is_pessimistic());
    must_exec(
        &mut tk,
        Statement::update("pessimistic", Filter::eq("v", 1), set_v(2)),
    )
    .await;

    // The update locks the row and sees the committed change, so it matches nothing
    let result = must_exec(
        &mut tk1,
        Statement::update("pessimistic", Filter::eq("v", 1), set_v(3)),
    )
    .await;
    assert_eq!(result.affected(), 0);
    assert_eq!(tk1.affected_rows(), 0);
    assert_eq!(tk1.history_length(), 0);

    // Locking reads see the latest commit, plain reads stay on the snapshot
    assert_eq!(
        must_query(&mut tk1, Statement::select_for_update("pessimistic", Filter::all())).await,
        vec![row(&[1, 2])]
    );
    assert_eq!(
        must_query(&mut tk1, Statement::select("pessimistic", Filter::all())).await,
        vec![row(&[1, 1])]
    );

    must_exec(
        &mut tk1,
        Statement::update("pessimistic", Filter::eq("v", 2), set_v(3)),
    )
    .await;
    assert_eq!(tk1.affected_rows(), 1);

    // A pessimistic lock does not block readers
    assert_eq!(
        must_query(&mut tk, Statement::select("pessimistic", Filter::all())).await,
        vec![row(&[1, 2])]
    );
    must_exec(&mut tk1, Statement::Commit).await;
    assert_eq!(
        must_query(&mut tk1, Statement::select("pessimistic", Filter::all())).await,
        vec![row(&[1, 3])]
    );

    // An update that waits on a FOR UPDATE lock applies after the holder commits
    must_exec(&mut tk1, Statement::begin_pessimistic()).await;
    must_query(
        &mut tk1,
        Statement::select_for_update("pessimistic", Filter::eq("k", 1)),
    )
    .await;
    let waiter = tokio::spawn(async move {
        let result = must_exec(
            &mut tk,
            Statement::update("pessimistic", Filter::eq("k", 1), set_v(5)),
        )
        .await;
        (tk, result)
    });
    kit.wait_for_edges(1).await;
    must_exec(
        &mut tk1,
        Statement::update("pessimistic", Filter::eq("k", 1), set_v(3)),
    )
    .await;
    must_exec(&mut tk1, Statement::Commit).await;

    let (mut tk, result) = waiter.await.unwrap();
    assert_eq!(result.affected(), 1);
    assert_eq!(
        must_query(&mut tk, Statement::select("pessimistic", Filter::all())).await,
        vec![row(&[1, 5])]
    );
}

#[tokio::test]
async fn test_blocked_update_reads_committed_value() {
    let kit = TestKit::new();
    let mut t1 = kit.session();
    let mut t2 = kit.session();

    must_exec(&mut t1, Statement::create_table("t", &["k", "v"], Some("k"))).await;
    must_exec(&mut t1, Statement::insert("t", vec![row(&[1, 1])])).await;

    must_exec(&mut t1, Statement::begin_pessimistic()).await;
    must_query(&mut t1, Statement::select_for_update("t", Filter::eq("k", 1))).await;

    must_exec(&mut t2, Statement::begin_pessimistic()).await;
    let waiter = tokio::spawn(async move {
        must_exec(&mut t2, Statement::update("t", Filter::eq("k", 1), incr_v())).await;
        must_exec(&mut t2, Statement::Commit).await;
        t2
    });
    kit.wait_for_edges(1).await;

    must_exec(&mut t1, Statement::update("t", Filter::eq("k", 1), set_v(3))).await;
    must_exec(&mut t1, Statement::Commit).await;

    let mut t2 = waiter.await.unwrap();
    assert_eq!(
        must_query(&mut t2, Statement::select("t", Filter::all())).await,
        vec![row(&[1, 4])]
    );
}

#[tokio::test]
async fn test_deadlock_aborts_one_side() {
    let kit = TestKit::new();
    let mut s1 = kit.session();
    let mut s2 = kit.session();

    must_exec(&mut s1, Statement::create_table("deadlock", &["k", "v"], Some("k"))).await;
    must_exec(
        &mut s1,
        Statement::insert("deadlock", vec![row(&[1, 1]), row(&[2, 1])]),
    )
    .await;

    must_exec(&mut s1, Statement::begin_pessimistic()).await;
    must_exec(&mut s2, Statement::begin_pessimistic()).await;
    must_exec(&mut s1, Statement::update("deadlock", Filter::eq("k", 1), incr_v())).await;
    must_exec(&mut s2, Statement::update("deadlock", Filter::eq("k", 2), incr_v())).await;

    let waiter = tokio::spawn(async move {
        must_exec(&mut s1, Statement::update("deadlock", Filter::eq("k", 2), incr_v())).await;
        must_exec(&mut s1, Statement::Commit).await;
        s1
    });
    kit.wait_for_edges(1).await;

    // k = 2 was locked by an earlier statement, so there is no statement retry
    let err = must_fail(
        &mut s2,
        Statement::update("deadlock", Filter::eq("k", 1), incr_v()),
    )
    .await;
    assert_eq!(err.code(), ErrorCode::LOCK_DEADLOCK);
    assert!(!s2.in_transaction());

    let mut s1 = waiter.await.unwrap();
    assert_eq!(
        must_query(&mut s1, Statement::select("deadlock", Filter::all())).await,
        vec![row(&[1, 2]), row(&[2, 2])]
    );

    let metrics = kit.engine.metrics().snapshot();
    assert_eq!(metrics.deadlock_total, 1);
    assert_eq!(metrics.errors("txn:1213"), 1);
    assert_eq!(kit.engine.detector().edge_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_statement_rollback() {
    let kit = TestKit::new();
    let mut setup = kit.session();
    must_exec(
        &mut setup,
        Statement::create_table("single_statement", &["id", "v"], Some("id")),
    )
    .await;
    must_exec(
        &mut setup,
        Statement::insert(
            "single_statement",
            vec![row(&[1, 1]), row(&[2, 1]), row(&[3, 1]), row(&[4, 1])],
        ),
    )
    .await;

    let table = kit.engine.table("single_statement").unwrap();
    let regions = kit.engine.router().split_table(table.id, 4, 2).unwrap();
    assert_eq!(regions.len(), 2);

    let mut t1 = kit.session();
    let mut t2 = kit.session();
    let ts1 = t1.begin_transaction(Some(TxnMode::Pessimistic)).await.unwrap();
    let ts2 = t2.begin_transaction(Some(TxnMode::Pessimistic)).await.unwrap();

    // Each transaction reaches its second region late, after the other one
    // has locked it
    let router = kit.engine.router();
    router.schedule_delay(ts1, regions[1], Duration::from_millis(20));
    router.schedule_delay(ts2, regions[0], Duration::from_millis(20));

    let run = |mut session: pessimist_txn::Session| async move {
        must_exec(
            &mut session,
            Statement::update("single_statement", Filter::all(), incr_v()),
        )
        .await;
        must_exec(&mut session, Statement::Commit).await;
        session
    };
    let h1 = tokio::spawn(run(t1));
    let h2 = tokio::spawn(run(t2));
    h1.await.unwrap();
    h2.await.unwrap();

    let rows = must_query(&mut setup, Statement::select("single_statement", Filter::all())).await;
    assert_eq!(
        rows,
        vec![row(&[1, 3]), row(&[2, 3]), row(&[3, 3]), row(&[4, 3])]
    );

    // Any deadlock was resolved by retrying the statement, never surfaced
    let metrics = kit.engine.metrics().snapshot();
    assert_eq!(metrics.deadlock_total, metrics.statement_retry_total);
    assert_eq!(metrics.errors("txn:1213"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delayed_commit_is_atomic_for_readers() {
    let kit = TestKit::new();
    let mut writer = kit.session();
    must_exec(&mut writer, Statement::create_table("atomic", &["id", "v"], Some("id"))).await;
    must_exec(
        &mut writer,
        Statement::insert(
            "atomic",
            vec![row(&[1, 1]), row(&[2, 1]), row(&[3, 1]), row(&[4, 1])],
        ),
    )
    .await;

    let table = kit.engine.table("atomic").unwrap();
    let router = kit.engine.router();
    let regions = router.split_table(table.id, 4, 2).unwrap();
    assert_eq!(regions.len(), 2);

    must_exec(&mut writer, Statement::begin_pessimistic()).await;
    must_exec(&mut writer, Statement::update("atomic", Filter::all(), incr_v())).await;

    // The second region answers late, so the commit lands there well after
    // it landed in the first one
    router.inject_delay(regions[1], Duration::from_millis(50)).unwrap();
    let commit = tokio::spawn(async move {
        must_exec(&mut writer, Statement::Commit).await;
        writer
    });

    let mut reader = kit.session();
    let mut snapshots = HashSet::new();
    loop {
        let finished = commit.is_finished();
        let rows = must_query(&mut reader, Statement::select("atomic", Filter::all())).await;
        let values: HashSet<_> = rows.iter().map(|row| row[1].clone()).collect();
        assert_eq!(values.len(), 1, "torn read: {rows:?}");
        snapshots.extend(values);
        if finished {
            break;
        }
    }
    commit.await.unwrap();
    router.clear_delay(regions[1]).unwrap();

    assert_eq!(
        must_query(&mut reader, Statement::select("atomic", Filter::all())).await,
        vec![row(&[1, 2]), row(&[2, 2]), row(&[3, 2]), row(&[4, 2])]
    );
    assert!(snapshots.contains(&pessimist_common::Value::Integer(2)));
}

#[tokio::test]
async fn test_txn_mode() {
    let kit = TestKit::new();
    let mut tk = kit.session();

    use TxnMode::{Optimistic, Pessimistic};
    let cases: [(Option<TxnMode>, &str, bool, bool); 18] = [
        (Some(Pessimistic), "pessimistic", false, true),
        (Some(Pessimistic), "optimistic", false, true),
        (Some(Pessimistic), "", false, true),
        (Some(Optimistic), "pessimistic", false, false),
        (Some(Optimistic), "optimistic", false, false),
        (Some(Optimistic), "", false, false),
        (None, "pessimistic", false, true),
        (None, "optimistic", false, false),
        (None, "", false, false),
        (Some(Pessimistic), "pessimistic", true, true),
        (Some(Pessimistic), "optimistic", true, true),
        (Some(Pessimistic), "", true, true),
        (Some(Optimistic), "pessimistic", true, false),
        (Some(Optimistic), "optimistic", true, false),
        (Some(Optimistic), "", true, false),
        (None, "pessimistic", true, true),
        (None, "optimistic", true, false),
        (None, "", true, true),
    ];
    for (begin, txn_mode, default, pessimistic) in cases {
        kit.engine
            .update_config(|config| config.pessimistic_txn.default = default);
        must_exec(&mut tk, Statement::SetTxnMode(txn_mode.to_string())).await;
        must_exec(&mut tk, Statement::Begin(begin)).await;
        assert_eq!(
            tk.is_pessimistic(),
            pessimistic,
            "begin {begin:?}, txn_mode {txn_mode:?}, default {default}"
        );
        must_exec(&mut tk, Statement::Rollback).await;
    }

    // Implicit transactions follow the same rules
    must_exec(&mut tk, Statement::SetAutocommit(false)).await;
    must_exec(
        &mut tk,
        Statement::CreateTable {
            name: "txn_mode".to_string(),
            columns: vec!["a".to_string()],
            primary_key: None,
            if_not_exists: true,
        },
    )
    .await;
    let cases: [(&str, bool, bool); 6] = [
        ("pessimistic", false, true),
        ("optimistic", false, false),
        ("", false, false),
        ("pessimistic", true, true),
        ("optimistic", true, false),
        ("", true, true),
    ];
    for (txn_mode, default, pessimistic) in cases {
        kit.engine
            .update_config(|config| config.pessimistic_txn.default = default);
        must_exec(&mut tk, Statement::SetTxnMode(txn_mode.to_string())).await;
        must_exec(&mut tk, Statement::Rollback).await;
        must_exec(&mut tk, Statement::insert("txn_mode", vec![row(&[1])])).await;
        assert!(tk.in_transaction());
        assert_eq!(
            tk.is_pessimistic(),
            pessimistic,
            "txn_mode {txn_mode:?}, default {default}"
        );
        must_exec(&mut tk, Statement::Rollback).await;
    }

    let err = must_fail(&mut tk, Statement::SetTxnMode("eager".to_string())).await;
    assert_eq!(err.code(), ErrorCode::INVALID_TXN_MODE);
}

#[tokio::test]
async fn test_pessimistic_disabled() {
    let kit = TestKit::with_config(Config::default().with_pessimistic_enabled(false));
    let mut tk = kit.session();

    must_exec(&mut tk, Statement::begin_pessimistic()).await;
    assert!(tk.in_transaction());
    assert!(!tk.is_pessimistic());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments() {
    const SESSIONS: i64 = 8;

    let kit = TestKit::new();
    let mut setup = kit.session();
    must_exec(&mut setup, Statement::create_table("counter", &["id", "n"], Some("id"))).await;
    must_exec(&mut setup, Statement::insert("counter", vec![row(&[1, 0])])).await;

    let mut handles = Vec::new();
    for _ in 0..SESSIONS {
        let mut session = kit.session();
        handles.push(tokio::spawn(async move {
            let start_ts = session
                .begin_transaction(Some(TxnMode::Pessimistic))
                .await
                .unwrap();
            must_exec(
                &mut session,
                Statement::update("counter", Filter::eq("id", 1), vec![Assignment::add("n", 1)]),
            )
            .await;
            let commit_ts = session.commit().await.unwrap();
            (start_ts, commit_ts)
        }));
    }

    let mut commits: HashSet<Timestamp> = HashSet::new();
    for handle in handles {
        let (start_ts, commit_ts) = handle.await.unwrap();
        assert!(commit_ts > start_ts);
        assert!(commits.insert(commit_ts), "commit timestamp {commit_ts} reused");
    }

    assert_eq!(
        must_query(&mut setup, Statement::select("counter", Filter::all())).await,
        vec![row(&[1, SESSIONS])]
    );
    assert_eq!(kit.engine.metrics().snapshot().deadlock_total, 0);
}

#[tokio::test]
async fn test_lock_held_until_commit() {
    let kit = TestKit::with_config(
        Config::default().with_lock_wait_timeout(Duration::from_millis(100)),
    );
    let mut t1 = kit.session();
    let mut t2 = kit.session();

    must_exec(&mut t1, Statement::create_table("t", &["k", "v"], Some("k"))).await;
    must_exec(&mut t1, Statement::insert("t", vec![row(&[1, 1])])).await;

    must_exec(&mut t1, Statement::begin_pessimistic()).await;
    must_query(&mut t1, Statement::select_for_update("t", Filter::eq("k", 1))).await;
    // Later statements of the same transaction don't release the lock
    must_query(&mut t1, Statement::select("t", Filter::all())).await;

    must_exec(&mut t2, Statement::begin_pessimistic()).await;
    let err = must_fail(&mut t2, Statement::update("t", Filter::eq("k", 1), set_v(9))).await;
    assert_eq!(err.code(), ErrorCode::LOCK_WAIT_TIMEOUT);
    assert!(!t2.in_transaction());

    must_exec(&mut t1, Statement::Commit).await;
    must_exec(&mut t2, Statement::update("t", Filter::eq("k", 1), set_v(9))).await;
    assert_eq!(
        must_query(&mut t1, Statement::select("t", Filter::all())).await,
        vec![row(&[1, 9])]
    );
    assert_eq!(kit.engine.metrics().snapshot().errors("txn:1205"), 1);
}

#[tokio::test]
async fn test_interrupt_wakes_lock_waiter() {
    let kit = TestKit::new();
    let mut t1 = kit.session();
    let mut t2 = kit.session();

    must_exec(&mut t1, Statement::create_table("t", &["k", "v"], Some("k"))).await;
    must_exec(&mut t1, Statement::insert("t", vec![row(&[1, 1])])).await;
    must_exec(&mut t1, Statement::begin_pessimistic()).await;
    must_exec(&mut t1, Statement::update("t", Filter::eq("k", 1), set_v(2))).await;

    must_exec(&mut t2, Statement::begin_pessimistic()).await;
    let interrupt = t2.interrupt_handle();
    let waiter = tokio::spawn(async move {
        let result = t2
            .execute(Statement::update("t", Filter::eq("k", 1), set_v(3)))
            .await;
        (t2, result)
    });
    kit.wait_for_edges(1).await;
    interrupt.interrupt();

    let (t2, result) = waiter.await.unwrap();
    assert_eq!(result.unwrap_err().code(), ErrorCode::QUERY_INTERRUPTED);
    assert!(!t2.in_transaction());
    assert_eq!(kit.engine.detector().edge_count(), 0);

    must_exec(&mut t1, Statement::Commit).await;
    assert_eq!(
        must_query(&mut t1, Statement::select("t", Filter::all())).await,
        vec![row(&[1, 2])]
    );
}

#[tokio::test]
async fn test_dropped_statement_releases_its_locks() {
    let kit = TestKit::new();
    let mut t1 = kit.session();
    let mut t2 = kit.session();

    must_exec(&mut t1, Statement::create_table("t", &["k", "v"], Some("k"))).await;
    must_exec(&mut t1, Statement::insert("t", vec![row(&[1, 1]), row(&[2, 1])])).await;
    let table = kit.engine.table("t").unwrap();
    let store = kit.engine.store();

    must_exec(&mut t1, Statement::begin_pessimistic()).await;
    must_query(&mut t1, Statement::select_for_update("t", Filter::eq("k", 2))).await;

    // t2's update locks k1, parks on k2 and is abandoned by its caller
    must_exec(&mut t2, Statement::begin_pessimistic()).await;
    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        t2.execute(Statement::update("t", Filter::all(), set_v(9))),
    )
    .await;
    assert!(abandoned.is_err());

    // k1 is free again while t2 is still open
    assert_eq!(store.lock_holder(&table.record_key(1)), None);
    assert!(t2.in_transaction());
    drop(t2);
    assert_eq!(kit.engine.detector().edge_count(), 0);

    must_exec(&mut t1, Statement::Commit).await;
    let mut t3 = kit.session();
    must_exec(&mut t3, Statement::update("t", Filter::all(), set_v(5))).await;
    assert_eq!(
        must_query(&mut t3, Statement::select("t", Filter::all())).await,
        vec![row(&[1, 5]), row(&[2, 5])]
    );
    assert!(store.locks().is_empty());
}

#[tokio::test]
async fn test_lock_and_read() {
    let kit = TestKit::new();
    let mut t1 = kit.session();

    must_exec(&mut t1, Statement::create_table("t", &["k", "v"], Some("k"))).await;
    must_exec(&mut t1, Statement::insert("t", vec![row(&[1, 7])])).await;
    let table = kit.engine.table("t").unwrap();
    let key: Key = table.record_key(1);

    assert_eq!(
        t1.lock_and_read(key.clone()).await.unwrap_err().code(),
        ErrorCode::NO_ACTIVE_TXN
    );

    let start_ts = t1.begin_transaction(Some(TxnMode::Pessimistic)).await.unwrap();
    assert_eq!(t1.lock_and_read(key.clone()).await.unwrap(), Some(row(&[1, 7])));
    assert_eq!(kit.engine.store().lock_holder(&key), Some(start_ts));
    assert_eq!(
        t1.lock_and_read(table.record_key(2)).await.unwrap(),
        None
    );

    t1.rollback();
    assert_eq!(kit.engine.store().lock_holder(&key), None);
}

#[tokio::test]
async fn test_duplicate_key_keeps_transaction() {
    let kit = TestKit::new();
    let mut t1 = kit.session();

    must_exec(&mut t1, Statement::create_table("t", &["k", "v"], Some("k"))).await;
    must_exec(&mut t1, Statement::insert("t", vec![row(&[1, 1])])).await;

    must_exec(&mut t1, Statement::begin_pessimistic()).await;
    let err = must_fail(&mut t1, Statement::insert("t", vec![row(&[1, 2])])).await;
    assert_eq!(err.code(), ErrorCode::DUPLICATE_KEY);
    assert!(t1.in_transaction());

    must_exec(&mut t1, Statement::insert("t", vec![row(&[2, 2])])).await;
    must_exec(&mut t1, Statement::Commit).await;
    assert_eq!(
        must_query(&mut t1, Statement::select("t", Filter::all())).await,
        vec![row(&[1, 1]), row(&[2, 2])]
    );
}

#[tokio::test]
async fn test_optimistic_write_conflict() {
    let kit = TestKit::new();
    let mut t1 = kit.session();
    let mut t2 = kit.session();

    must_exec(&mut t1, Statement::create_table("t", &["k", "v"], Some("k"))).await;
    must_exec(&mut t1, Statement::insert("t", vec![row(&[1, 1])])).await;

    must_exec(&mut t1, Statement::begin_optimistic()).await;
    must_exec(&mut t1, Statement::update("t", Filter::eq("k", 1), set_v(10))).await;
    must_exec(&mut t2, Statement::update("t", Filter::eq("k", 1), set_v(20))).await;

    // Explicit transactions are never retried
    let err = must_fail(&mut t1, Statement::Commit).await;
    assert_eq!(err.code(), ErrorCode::WRITE_CONFLICT);
    assert!(!t1.in_transaction());
    assert_eq!(
        must_query(&mut t1, Statement::select("t", Filter::all())).await,
        vec![row(&[1, 20])]
    );
}

#[tokio::test]
async fn test_optimistic_select_for_update_conflict() {
    let kit = TestKit::new();
    let mut t1 = kit.session();
    let mut t2 = kit.session();

    must_exec(&mut t1, Statement::create_table("t", &["k", "v"], Some("k"))).await;
    must_exec(&mut t1, Statement::insert("t", vec![row(&[1, 1]), row(&[2, 1])])).await;

    must_exec(&mut t1, Statement::begin_optimistic()).await;
    must_query(&mut t1, Statement::select_for_update("t", Filter::eq("k", 1))).await;
    must_exec(&mut t1, Statement::update("t", Filter::eq("k", 2), set_v(5))).await;
    must_exec(&mut t2, Statement::update("t", Filter::eq("k", 1), set_v(9))).await;

    let err = must_fail(&mut t1, Statement::Commit).await;
    assert_eq!(err.code(), ErrorCode::WRITE_CONFLICT);
    assert_eq!(
        must_query(&mut t1, Statement::select("t", Filter::all())).await,
        vec![row(&[1, 9]), row(&[2, 1])]
    );
}

#[tokio::test]
async fn test_implicit_optimistic_retry() {
    let kit = TestKit::new();
    let mut t1 = kit.session();
    let mut t2 = kit.session();

    must_exec(&mut t1, Statement::create_table("t", &["k", "v"], Some("k"))).await;
    must_exec(&mut t1, Statement::insert("t", vec![row(&[1, 1])])).await;

    must_exec(&mut t1, Statement::SetAutocommit(false)).await;
    must_exec(&mut t1, Statement::update("t", Filter::eq("k", 1), incr_v())).await;
    assert!(!t1.is_pessimistic());
    assert_eq!(t1.history_length(), 1);

    must_exec(&mut t2, Statement::update("t", Filter::eq("k", 1), incr_v())).await;

    // The conflict is resolved by replaying the update on fresh data
    must_exec(&mut t1, Statement::Commit).await;
    assert!(!t1.in_transaction());
    assert_eq!(
        must_query(&mut t2, Statement::select("t", Filter::all())).await,
        vec![row(&[1, 3])]
    );

    let metrics = kit.engine.metrics().snapshot();
    assert!(metrics.statement_retry_total >= 1);
    assert_eq!(metrics.errors("txn:9007"), 0);
    assert_eq!(metrics.queries("Update", "OK"), 2);
    // insert, t2's update, t1's retried transaction and t2's autocommit select
    assert_eq!(metrics.txn_commit_total, 4);
    assert_eq!(metrics.txn_rollback_total, 1);
}

#[tokio::test]
async fn test_retry_limit_zero_surfaces_conflict() {
    let kit = TestKit::with_config(Config::default().with_retry_limit(0));
    let mut t1 = kit.session();
    let mut t2 = kit.session();

    must_exec(&mut t1, Statement::create_table("t", &["k", "v"], Some("k"))).await;
    must_exec(&mut t1, Statement::insert("t", vec![row(&[1, 1])])).await;

    must_exec(&mut t1, Statement::SetAutocommit(false)).await;
    must_exec(&mut t1, Statement::update("t", Filter::eq("k", 1), incr_v())).await;
    must_exec(&mut t2, Statement::update("t", Filter::eq("k", 1), incr_v())).await;

    let err = must_fail(&mut t1, Statement::Commit).await;
    assert_eq!(err.code(), ErrorCode::WRITE_CONFLICT);
    assert_eq!(
        must_query(&mut t2, Statement::select("t", Filter::all())).await,
        vec![row(&[1, 2])]
    );
}

#[tokio::test]
async fn test_expired_lock_is_resolved() {
    let kit = TestKit::with_config(
        Config::default().with_lock_ttl(Some(Duration::from_millis(50))),
    );
    let mut t1 = kit.session();
    let mut t2 = kit.session();

    must_exec(&mut t1, Statement::create_table("t", &["k", "v"], Some("k"))).await;
    must_exec(&mut t1, Statement::insert("t", vec![row(&[1, 1])])).await;

    must_exec(&mut t1, Statement::begin_pessimistic()).await;
    must_exec(&mut t1, Statement::update("t", Filter::eq("k", 1), set_v(10))).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    must_exec(&mut t2, Statement::update("t", Filter::eq("k", 1), set_v(20))).await;

    let err = must_fail(&mut t1, Statement::Commit).await;
    assert_eq!(err.code(), ErrorCode::TXN_LOCK_NOT_FOUND);
    assert_eq!(
        must_query(&mut t2, Statement::select("t", Filter::all())).await,
        vec![row(&[1, 20])]
    );
}

#[tokio::test]
async fn test_metrics_snapshot() {
    let kit = TestKit::new();
    {
        let mut tk = kit.session();
        must_exec(&mut tk, Statement::create_table("t", &["k", "v"], Some("k"))).await;
        must_exec(&mut tk, Statement::insert("t", vec![row(&[1, 1])])).await;
        must_fail(&mut tk, Statement::insert("t", vec![row(&[1, 1])])).await;
        must_fail(&mut tk, Statement::select("missing", Filter::all())).await;
        assert_eq!(kit.engine.metrics().snapshot().connections, 1);
    }

    let metrics = kit.engine.metrics().snapshot();
    assert_eq!(metrics.connections, 0);
    assert_eq!(metrics.queries("Insert", "OK"), 1);
    assert_eq!(metrics.queries("Insert", "Error"), 1);
    assert_eq!(metrics.errors("executor:1062"), 1);
    assert_eq!(metrics.errors("schema:1146"), 1);
    assert_eq!(metrics.handle_query_duration_seconds.count, 4);

    let json = metrics.to_json().unwrap();
    assert!(json.contains("\"query_total\""));
}
