//! Integration tests against a file-backed referral store
//!
//! These run the services end to end over a real SQLite file so that pooled
//! connections and immediate transactions behave as in production.

use std::sync::Arc;
use std::thread;

use referral_store::db::{closure, nodes, pages};
use referral_store::services::{LeadResult, ReferralEvent, Services};
use referral_store::{Applicant, Config, OperatorContext, ReferralDb};
use tempfile::TempDir;

/// Open a store in a fresh temporary directory with one active page
fn create_store(page_id: &str) -> (Arc<ReferralDb>, Services, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        storage_dir: temp_dir.path().to_path_buf(),
        ..Default::default()
    };
    let db = Arc::new(ReferralDb::open(&config).unwrap());
    db.transaction(|conn| pages::create_page(conn, page_id, None, "Launch"))
        .unwrap();
    let services = Services::new(db.clone(), Arc::new(config));
    (db, services, temp_dir)
}

fn expect_created(result: LeadResult) -> Box<referral_store::services::LeadReceipt> {
    match result {
        LeadResult::Created(receipt) => receipt,
        LeadResult::Conflict { existing_lead_id } => panic!("unexpected conflict with {}", existing_lead_id),
    }
}

/// Alice shares her link, Bob signs up through it, Carol through Bob's
#[test]
fn test_alice_bob_carol_end_to_end() {
    let (db, services, _temp) = create_store("launch");
    let mut events = services.events.subscribe();

    let alice = services.attribution.record_click("launch", Some("alice")).unwrap();
    assert_eq!(alice.click_count, 1);

    let bob = expect_created(
        services
            .attribution
            .submit_lead("launch", Some("alice"), &Applicant::new("Bob", "bob@example.org"))
            .unwrap(),
    );
    assert_eq!(bob.referrer.id, alice.id);
    assert_eq!(bob.referrer.lead_count, 1);
    assert!(bob.identity_created);
    assert_eq!(
        bob.submitter_link,
        format!("http://localhost:8080/p/launch?ref={}", bob.submitter.handle)
    );

    services
        .attribution
        .record_click("launch", Some(&bob.submitter.handle))
        .unwrap();
    let carol = expect_created(
        services
            .attribution
            .submit_lead(
                "launch",
                Some(&bob.submitter.handle),
                &Applicant::new("Carol", "carol@example.org"),
            )
            .unwrap(),
    );

    let upline = services.tree.full_upline(&carol.submitter.id).unwrap();
    let upline: Vec<(&str, i32)> = upline.iter().map(|r| (r.node.handle.as_str(), r.depth)).collect();
    assert_eq!(upline, vec![(bob.submitter.handle.as_str(), 1), ("alice", 2)]);

    let stats = services.tree.subtree_statistics(&alice.id).unwrap();
    assert_eq!(stats.total_referrals, 2);
    assert_eq!(stats.total_leads, 2);
    assert_eq!(stats.total_clicks, 2);
    assert_eq!(stats.conversion_rate, 100.0);
    assert_eq!(stats.max_depth, 2);

    let referrals = services.tree.direct_referrals(&alice.id).unwrap();
    assert_eq!(referrals.len(), 1);
    assert_eq!(referrals[0].owner.as_ref().unwrap().display_name, "Bob");

    let detail = services.tree.level_one_detail(&alice.id, 1, 10).unwrap();
    assert_eq!(detail.total, 1);
    assert_eq!(detail.items[0].direct_referrals, 1);
    assert_eq!(detail.items[0].lead_status.as_deref(), Some("new"));

    let page = db.with_conn(|conn| pages::get_page(conn, "launch")).unwrap().unwrap();
    assert_eq!(page.view_count, 2);
    assert!(db
        .with_conn(|conn| closure::closure_violations(conn, "launch"))
        .unwrap()
        .is_empty());

    let mut created = 0;
    while let Ok(event) = events.try_recv() {
        if let ReferralEvent::LeadCreated { .. } = event {
            created += 1;
        }
    }
    assert_eq!(created, 2);
}

#[test]
fn test_resubmission_returns_first_lead() {
    let (db, services, _temp) = create_store("launch");
    let applicant = Applicant::new("Bob", "bob@example.org");

    let first = expect_created(
        services
            .attribution
            .submit_lead("launch", Some("alice"), &applicant)
            .unwrap(),
    );
    let before = db.stats().unwrap();

    let again = services
        .attribution
        .submit_lead("launch", Some("alice"), &applicant)
        .unwrap();
    assert!(again.is_conflict());
    assert_eq!(again.lead_id(), first.lead.id);

    let after = db.stats().unwrap();
    assert_eq!(after.lead_count, before.lead_count);
    assert_eq!(after.node_count, before.node_count);
    assert_eq!(after.edge_count, before.edge_count);

    let alice = services.attribution.find_node("launch", "alice").unwrap().unwrap();
    assert_eq!(alice.lead_count, 1);
}

#[test]
fn test_concurrent_duplicate_submissions_yield_one_lead() {
    let (db, services, _temp) = create_store("launch");
    let attribution = services.attribution.clone();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let attribution = attribution.clone();
            thread::spawn(move || {
                attribution
                    .submit_lead("launch", Some("alice"), &Applicant::new("Bob", "bob@example.org"))
                    .unwrap()
            })
        })
        .collect();

    let results: Vec<LeadResult> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let created = results.iter().filter(|r| !r.is_conflict()).count();
    assert_eq!(created, 1);

    let winner = results.iter().find(|r| !r.is_conflict()).unwrap().lead_id().to_string();
    assert!(results.iter().all(|r| r.lead_id() == winner));

    assert_eq!(db.stats().unwrap().lead_count, 1);
    let alice = services.attribution.find_node("launch", "alice").unwrap().unwrap();
    assert_eq!(alice.lead_count, 1);
}

#[test]
fn test_concurrent_distinct_submissions_all_credited() {
    let (db, services, _temp) = create_store("launch");

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let attribution = services.attribution.clone();
            thread::spawn(move || {
                attribution
                    .submit_lead(
                        "launch",
                        Some("alice"),
                        &Applicant::new(format!("Applicant {}", i), format!("applicant{}@example.org", i)),
                    )
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert!(!handle.join().unwrap().is_conflict());
    }

    let alice = services.attribution.find_node("launch", "alice").unwrap().unwrap();
    assert_eq!(alice.lead_count, 6);
    assert_eq!(services.tree.direct_referrals(&alice.id).unwrap().len(), 6);
    assert!(db
        .with_conn(|conn| closure::closure_violations(conn, "launch"))
        .unwrap()
        .is_empty());
}

#[test]
fn test_reassignment_scope() {
    let (db, services, _temp) = create_store("launch");
    let policy = nodes::HandlePolicy::default();

    // root -> (a, p), a -> n -> c
    let ids: Vec<String> = db
        .transaction(|conn| {
            let mut ids = Vec::new();
            for handle in ["root", "a", "p", "n", "c"] {
                ids.push(nodes::create_node(conn, &policy, "launch", None, Some(handle))?.id);
            }
            closure::attach(conn, &ids[1], &ids[0])?;
            closure::attach(conn, &ids[2], &ids[0])?;
            closure::attach(conn, &ids[3], &ids[1])?;
            closure::attach(conn, &ids[4], &ids[3])?;
            Ok(ids)
        })
        .unwrap();
    let (root, a, p, n, c) = (&ids[0], &ids[1], &ids[2], &ids[3], &ids[4]);

    services
        .reassignment
        .reassign(&OperatorContext::new("admin"), n, p)
        .unwrap();

    // ancestors(n) = {p} ∪ ancestors(p), depths offset by one
    let upline: Vec<(String, i32)> = services
        .tree
        .full_upline(n)
        .unwrap()
        .into_iter()
        .map(|r| (r.node.id, r.depth))
        .collect();
    assert_eq!(upline, vec![(p.clone(), 1), (root.clone(), 2)]);

    // c keeps its distance to n
    let below: Vec<(String, i32)> = services
        .tree
        .full_downline(n)
        .unwrap()
        .into_iter()
        .map(|r| (r.node.id, r.depth))
        .collect();
    assert_eq!(below, vec![(c.clone(), 1)]);
    assert_eq!(services.tree.full_upline(c).unwrap().len(), 3);
    assert!(services.tree.full_downline(a).unwrap().is_empty());

    assert!(db
        .with_conn(|conn| closure::closure_violations(conn, "launch"))
        .unwrap()
        .is_empty());
}

#[test]
fn test_store_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        storage_dir: temp_dir.path().to_path_buf(),
        ..Default::default()
    };

    let lead_id = {
        let db = Arc::new(ReferralDb::open(&config).unwrap());
        db.transaction(|conn| pages::create_page(conn, "launch", None, "Launch"))
            .unwrap();
        let services = Services::new(db, Arc::new(config.clone()));
        expect_created(
            services
                .attribution
                .submit_lead("launch", None, &Applicant::new("Bob", "bob@example.org"))
                .unwrap(),
        )
        .lead
        .id
    };

    let db = Arc::new(ReferralDb::open(&config).unwrap());
    let services = Services::new(db, Arc::new(config));
    let lead = services.attribution.get_lead(&lead_id).unwrap().unwrap();
    assert_eq!(lead.submitter_email, "bob@example.org");
    let entry = services.attribution.find_node("launch", "duplication").unwrap().unwrap();
    assert_eq!(entry.lead_count, 1);
}
