use axum::http::StatusCode;
use kiosk_devkit::{SimulatedKiosk, TestHarness};
use kiosk_kernel::context::RequestContext;
use kiosk_kernel::dispatch;
use kiosk_kernel::models::{DeviceStatus, NewDevice};
use serde_json::json;
use std::collections::HashSet;
use time::{Duration, OffsetDateTime};

#[tokio::test]
async fn bulk_migration_end_to_end() {
    let h = TestHarness::new().unwrap();
    let source = h.seed_tenant("Old School", Some("old-token")).unwrap();
    let target = h.seed_tenant("New School", Some("new-token")).unwrap();
    let k1 = h.seed_device("k1", Some(source)).unwrap();
    let k2 = h.seed_device("k2", Some(target)).unwrap();
    let k3 = h.seed_device("k3", Some(source)).unwrap();

    let (status, body) = h
        .admin_post("/migrations/bulk", json!({ "target_company_id": target, "kiosk_ids": [k1, k2, k3] }))
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queued_count"], 2);
    assert_eq!(body["skipped_count"], 1);

    let (_, commands) = h.admin_get(&format!("/devices/{k2}/commands")).await.unwrap();
    assert_eq!(commands["commands"].as_array().unwrap().len(), 0);

    let kiosk = SimulatedKiosk::new(k1, "old-token");
    let command = kiosk.poll_once(&h).await.unwrap().unwrap();
    assert_eq!(command["type"], "token_swap_reboot");
    assert_eq!(command["payload"]["token"], "new-token");
    assert_eq!(kiosk.token(), "new-token");

    let (_, device) = h.admin_get(&format!("/devices/{k1}")).await.unwrap();
    assert_eq!(device["device"]["tenant_id"], target);
    assert_eq!(device["migration"]["status"], "completed");
    assert!(device["migration"].get("target_token").is_none());

    // le kiosque continue avec le nouveau token
    let hb = kiosk.heartbeat(&h).await.unwrap();
    assert_eq!(hb.status, StatusCode::OK);

    let (_, migrations) = h.admin_get("/migrations").await.unwrap();
    assert_eq!(migrations["migrations"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn requeued_migration_keeps_kiosk_reachable() {
    let h = TestHarness::new().unwrap();
    let source = h.seed_tenant("Old School", Some("old-token")).unwrap();
    let first = h.seed_tenant("First", Some("tok-1")).unwrap();
    let second = h.seed_tenant("Second", Some("tok-2")).unwrap();
    let k1 = h.seed_device("k1", Some(source)).unwrap();

    for target in [first, second] {
        let (status, _) = h
            .admin_post("/migrations/bulk", json!({ "target_company_id": target, "kiosk_ids": [k1] }))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
    }

    let kiosk = SimulatedKiosk::new(k1, "old-token");
    let command = kiosk.poll_once(&h).await.unwrap().unwrap();
    assert_eq!(command["payload"]["token"], "tok-2");
    assert!(kiosk.poll_once(&h).await.unwrap().is_none());

    let hb = kiosk.heartbeat(&h).await.unwrap();
    assert_eq!(hb.status, StatusCode::OK);
    let (_, device) = h.admin_get(&format!("/devices/{k1}")).await.unwrap();
    assert_eq!(device["device"]["tenant_id"], second);
    assert_eq!(device["migration"]["status"], "completed");

    let (_, commands) = h.admin_get(&format!("/devices/{k1}/commands")).await.unwrap();
    let statuses: Vec<_> = commands["commands"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["status"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(statuses, vec!["executed", "failed"]);

    let stale = SimulatedKiosk::new(k1, "tok-1");
    assert_eq!(stale.heartbeat(&h).await.unwrap().status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn bulk_migration_without_token_is_precondition_failure() {
    let h = TestHarness::new().unwrap();
    let source = h.seed_tenant("A", Some("tok-a")).unwrap();
    let bare = h.seed_tenant("No Token", None).unwrap();
    let k1 = h.seed_device("k1", Some(source)).unwrap();

    let (status, body) = h
        .admin_post("/migrations/bulk", json!({ "target_company_id": bare, "kiosk_ids": [k1] }))
        .await
        .unwrap();
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["success"], false);

    let (_, commands) = h.admin_get(&format!("/devices/{k1}/commands")).await.unwrap();
    assert!(commands["commands"].as_array().unwrap().is_empty());
    let (_, audit) = h.admin_get(&format!("/devices/{k1}/audit")).await.unwrap();
    assert!(audit["entries"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn control_commands_are_claimed_once_in_order() {
    let h = TestHarness::new().unwrap();
    let tenant = h.seed_tenant("School", Some("tok")).unwrap();
    let device = h.seed_device("lobby", Some(tenant)).unwrap();

    let requests = [
        ("/commands/fast-loop", json!({ "kiosk_id": device, "enable": true })),
        ("/commands/debug-mode", json!({ "kiosk_id": device, "debug_mode": true })),
        ("/commands/reboot", json!({ "kiosk_id": device, "delay": 30 })),
        ("/commands/full-update", json!({ "kiosk_id": device })),
    ];
    let mut queued = Vec::new();
    for (path, body) in requests {
        let (status, resp) = h.admin_post(path, body).await.unwrap();
        assert_eq!(status, StatusCode::OK, "{path}: {resp}");
        queued.push(resp["command_id"].as_i64().unwrap());
    }

    let kiosk = SimulatedKiosk::new(device, "tok");
    let hb = kiosk.heartbeat(&h).await.unwrap();
    assert_eq!(hb.body["poll_interval_secs"], 10);
    assert_eq!(hb.body["debug_mode"], true);

    while kiosk.poll_once(&h).await.unwrap().is_some() {}
    assert_eq!(kiosk.claimed_ids(), queued);

    let (_, command) = h.admin_get(&format!("/commands/{}", queued[2])).await.unwrap();
    assert_eq!(command["command"]["status"], "executed");
    assert_eq!(command["command"]["output"], "ok");
    assert_eq!(command["command"]["payload"]["delay_seconds"], 30);
}

#[tokio::test]
async fn duplicate_and_conflicting_reports() {
    let h = TestHarness::new().unwrap();
    let tenant = h.seed_tenant("School", Some("tok")).unwrap();
    let device = h.seed_device("lobby", Some(tenant)).unwrap();
    let (_, resp) = h.admin_post("/commands/full-update", json!({ "kiosk_id": device })).await.unwrap();
    let id = resp["command_id"].as_i64().unwrap();

    let kiosk = SimulatedKiosk::new(device, "tok");
    kiosk.claim(&h).await.unwrap().unwrap();

    let first = kiosk.report(&h, id, "executed", Some("ok"), None).await.unwrap();
    assert_eq!(first.status, StatusCode::OK);
    let again = kiosk.report(&h, id, "executed", Some("ok"), None).await.unwrap();
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(again.body["message"], "result already recorded");

    let conflicting = kiosk.report(&h, id, "failed", None, Some("boom")).await.unwrap();
    assert_eq!(conflicting.status, StatusCode::OK);
    assert_eq!(conflicting.body["ignored"], true);

    let (_, command) = h.admin_get(&format!("/commands/{id}")).await.unwrap();
    assert_eq!(command["command"]["status"], "executed");
    assert_eq!(command["command"]["error"], serde_json::Value::Null);

    let missing = kiosk.report(&h, 9999, "executed", None, None).await.unwrap();
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn concurrent_polls_never_share_a_command() {
    let h = TestHarness::new().unwrap();
    let tenant = h.seed_tenant("School", Some("tok")).unwrap();
    let device = h.seed_device("lobby", Some(tenant)).unwrap();
    for delay in 0..10 {
        h.admin_post("/commands/reboot", json!({ "kiosk_id": device, "delay": delay }))
            .await
            .unwrap();
    }

    let a = SimulatedKiosk::new(device, "tok");
    let b = SimulatedKiosk::new(device, "tok");
    loop {
        let (ca, cb) = tokio::join!(a.claim(&h), b.claim(&h));
        let (ca, cb) = (ca.unwrap(), cb.unwrap());
        if ca.is_none() && cb.is_none() {
            break;
        }
    }

    let mut all = a.claimed_ids();
    all.extend(b.claimed_ids());
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 10);
    assert_eq!(unique.len(), 10);
}

#[tokio::test]
async fn timed_out_command_ignores_late_result() {
    let h = TestHarness::new().unwrap();
    let tenant = h.seed_tenant("School", Some("tok")).unwrap();
    let device = h.seed_device("lobby", Some(tenant)).unwrap();
    let (_, resp) = h.admin_post("/commands/reboot", json!({ "kiosk_id": device })).await.unwrap();
    let id = resp["command_id"].as_i64().unwrap();

    let kiosk = SimulatedKiosk::new(device, "tok");
    kiosk.claim(&h).await.unwrap().unwrap();

    let later = OffsetDateTime::now_utc() + Duration::hours(1);
    let summary = dispatch::sweep(&h.db, &RequestContext::system(), h.config.claim_timeout(), later).unwrap();
    assert_eq!(summary.timed_out, 1);

    let late = kiosk.report(&h, id, "executed", Some("done"), None).await.unwrap();
    assert_eq!(late.body["ignored"], true);
    assert_eq!(late.body["status"], "timeout");

    let (_, audit) = h.admin_get(&format!("/devices/{device}/audit")).await.unwrap();
    assert_eq!(audit["entries"][0]["action"], "late_result");
    assert_eq!(audit["entries"][1]["action"], "timeout");
}

#[tokio::test]
async fn device_list_applies_effective_status() {
    let h = TestHarness::new().unwrap();
    let tenant = h.seed_tenant("School", Some("tok")).unwrap();
    let mut stale = NewDevice::new("stale", Some(tenant));
    stale.status = DeviceStatus::Online;
    stale.last_heartbeat = Some(OffsetDateTime::now_utc() - Duration::minutes(20));
    let stale = h.seed_raw_device(&stale).unwrap();
    let fresh = h.seed_device("fresh", Some(tenant)).unwrap();

    let (status, body) = h.admin_get("/devices").await.unwrap();
    assert_eq!(status, StatusCode::OK);
    let devices = body["devices"].as_array().unwrap();
    let find = |id: i64| devices.iter().find(|d| d["id"] == id).unwrap();
    assert_eq!(find(stale)["status"], "online");
    assert_eq!(find(stale)["effective_status"], "offline");
    assert_eq!(find(fresh)["effective_status"], "online");
}

#[tokio::test]
async fn dangerous_shell_command_rejected() {
    let h = TestHarness::new().unwrap();
    let tenant = h.seed_tenant("School", Some("tok")).unwrap();
    let device = h.seed_device("lobby", Some(tenant)).unwrap();

    let (status, _) = h
        .admin_post("/commands/execute", json!({ "kiosk_id": device, "command": "rm -rf /opt" }))
        .await
        .unwrap();
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = h
        .admin_post("/commands/execute", json!({ "kiosk_id": device, "command": "uptime" }))
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert!(body["command_id"].as_i64().is_some());
}
