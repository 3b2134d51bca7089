//! Command handling against recording doubles.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use attguard::dispatch::Dispatcher;
use attguard::ports::PortRange;
use attguard::protocol::{
    AuthSpec, CodeSpec, Command, CommandType, CreatePrincipal, Credentials, PrincipalRecord,
    PrincipalRef, Response, LEGACY_CONFIG_KEY,
};

use crate::support::{config_with_snapshot, registry, CountingKernel, RecordingPolicy};

const OWNER: Credentials = Credentials { pid: 4000, uid: 1000, gid: 1000 };
const STRANGER: Credentials = Credentials { pid: 4001, uid: 1001, gid: 1001 };
const ROOT: Credentials = Credentials { pid: 1, uid: 0, gid: 0 };

struct Harness {
    dispatcher: Arc<Dispatcher>,
    policy: Arc<RecordingPolicy>,
    kernel: Arc<CountingKernel>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let snapshot = dir.path().join("state.json");
    let kernel = CountingKernel::new(20_000, 20_100);
    let policy = RecordingPolicy::new();
    let reg = Arc::new(registry(&snapshot, kernel.clone(), policy.clone()));
    let dispatcher = Arc::new(Dispatcher::new(&config_with_snapshot(&snapshot), policy.clone(), reg));
    Harness {
        dispatcher,
        policy,
        kernel,
        _dir: dir,
    }
}

fn command(kind: CommandType, statement: serde_json::Value, creds: Credentials) -> Command {
    let mut cmd = Command::new(kind, &statement).expect("statement serializes");
    cmd.stamp(creds);
    cmd
}

fn create(id: u64, auth: AuthSpec, creds: Credentials) -> Command {
    let req = CreatePrincipal {
        id,
        auth,
        code: CodeSpec {
            image: "sha256:img".to_owned(),
            configs: BTreeMap::new(),
        },
    };
    let mut cmd = Command::new(CommandType::CreatePrincipal, &req).expect("statement serializes");
    cmd.stamp(creds);
    cmd
}

fn pooled(n: u32) -> AuthSpec {
    AuthSpec {
        nport: Some(n),
        ..AuthSpec::default()
    }
}

fn delete(id: u64, creds: Credentials) -> Command {
    let mut cmd = Command::new(CommandType::DeletePrincipal, &PrincipalRef { id })
        .expect("statement serializes");
    cmd.stamp(creds);
    cmd
}

fn principal(response: Response) -> PrincipalRecord {
    match response {
        Response::Principal { principal } => principal,
        other => panic!("expected a principal, got {other:?}"),
    }
}

fn failure(response: Response) -> String {
    match response {
        Response::Status { success: false, info } => info,
        other => panic!("expected a failure, got {other:?}"),
    }
}

#[tokio::test]
async fn generations_get_disjoint_ranges_and_delete_retracts_latest() {
    let h = harness();

    let first = principal(h.dispatcher.dispatch(create(1, pooled(10), OWNER)).await);
    let second = principal(h.dispatcher.dispatch(create(1, pooled(10), OWNER)).await);

    assert_eq!((first.gn, second.gn), (0, 1));
    let a = PortRange { lo: first.port_lo, hi: first.port_hi };
    let b = PortRange { lo: second.port_lo, hi: second.port_hi };
    assert!(!a.overlaps(&b));
    assert_eq!(first.bearer.as_deref(), Some("bearer-1:0"));
    assert_eq!(first.speaker, OWNER.pid);
    assert_eq!(h.dispatcher.generations(1).await.len(), 2);
    assert_eq!(h.kernel.reserves_for(1), 2);

    let reply = h.dispatcher.dispatch(delete(1, OWNER)).await;
    assert!(reply.is_success(), "{reply:?}");
    assert!(!h.dispatcher.has_principal(1).await);

    let retracted: Vec<String> = h
        .policy
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("retract_principal"))
        .collect();
    assert_eq!(retracted.len(), 1);
    assert!(retracted[0].contains(" 1:1 "), "{retracted:?}");

    assert_eq!(h.kernel.owner_of(a.lo), None);
    assert_eq!(h.kernel.owner_of(b.lo), None);
}

#[tokio::test]
async fn only_the_registering_pid_or_root_may_delete() {
    let h = harness();
    let _ = principal(h.dispatcher.dispatch(create(5, pooled(4), OWNER)).await);

    let info = failure(h.dispatcher.dispatch(delete(5, STRANGER)).await);
    assert!(info.contains("may not modify"), "{info}");
    assert!(h.dispatcher.has_principal(5).await);
    assert_eq!(h.policy.count("retract_principal"), 0);

    assert!(h.dispatcher.dispatch(delete(5, OWNER)).await.is_success());

    let _ = principal(h.dispatcher.dispatch(create(6, pooled(4), OWNER)).await);
    assert!(h.dispatcher.dispatch(delete(6, ROOT)).await.is_success());
}

#[tokio::test]
async fn delete_of_unknown_id_fails() {
    let h = harness();
    let info = failure(h.dispatcher.dispatch(delete(77, OWNER)).await);
    assert!(info.contains("not found"), "{info}");
}

#[tokio::test]
async fn explicit_ranges_may_not_overlap_on_one_address() {
    let h = harness();
    let explicit = |lo, hi| AuthSpec {
        ip: Some("10.0.0.5".to_owned()),
        port_lo: Some(lo),
        port_hi: Some(hi),
        nport: None,
    };

    let p = principal(h.dispatcher.dispatch(create(2, explicit(8000, 8010), OWNER)).await);
    assert_eq!((p.ip.as_str(), p.port_lo, p.port_hi), ("10.0.0.5", 8000, 8010));

    let info = failure(h.dispatcher.dispatch(create(3, explicit(8005, 8020), OWNER)).await);
    assert!(info.contains("held by principal 2:"), "{info}");

    let adjacent = h.dispatcher.dispatch(create(3, explicit(8010, 8020), OWNER)).await;
    assert!(matches!(adjacent, Response::Principal { .. }));
}

fn explicit_local(lo: u32, hi: u32) -> AuthSpec {
    AuthSpec {
        ip: Some("127.0.0.1".to_owned()),
        port_lo: Some(lo),
        port_hi: Some(hi),
        nport: None,
    }
}

#[tokio::test]
async fn explicit_local_ranges_are_taken_from_the_pool() {
    let h = harness();

    let explicit = principal(h.dispatcher.dispatch(create(2, explicit_local(20_090, 20_100), OWNER)).await);
    assert_eq!((explicit.port_lo, explicit.port_hi), (20_090, 20_100));
    assert_eq!(h.kernel.owner_of(20_095), Some(2));

    let pooled_one = principal(h.dispatcher.dispatch(create(3, pooled(10), OWNER)).await);
    let a = PortRange { lo: explicit.port_lo, hi: explicit.port_hi };
    let b = PortRange { lo: pooled_one.port_lo, hi: pooled_one.port_hi };
    assert!(!a.overlaps(&b), "{a} and {b} overlap");
    assert_eq!((b.lo, b.hi), (20_080, 20_090));

    let info = failure(h.dispatcher.dispatch(create(4, explicit_local(20_085, 20_087), OWNER)).await);
    assert!(info.contains("held by principal 3:"), "{info}");

    assert!(h.dispatcher.dispatch(delete(2, OWNER)).await.is_success());
    assert_eq!(h.kernel.owner_of(20_095), None);
    let reused = principal(h.dispatcher.dispatch(create(5, explicit_local(20_090, 20_100), OWNER)).await);
    assert_eq!(reused.port_lo, 20_090);
}

#[tokio::test]
async fn explicit_local_range_straddling_the_pool_is_refused() {
    let h = harness();

    let info = failure(h.dispatcher.dispatch(create(2, explicit_local(19_990, 20_010), OWNER)).await);
    assert!(info.contains("straddle the local pool"), "{info}");
    assert_eq!(h.policy.count("register_principal"), 0);

    let outside = principal(h.dispatcher.dispatch(create(2, explicit_local(9_000, 9_010), OWNER)).await);
    assert_eq!(outside.port_lo, 9_000);
    let whole_pool = principal(h.dispatcher.dispatch(create(3, pooled(100), OWNER)).await);
    assert_eq!((whole_pool.port_lo, whole_pool.port_hi), (20_000, 20_100));
}

#[tokio::test]
async fn pending_registration_holds_its_range_without_blocking_others() {
    let h = harness();
    h.policy.close_gate();

    let creating = {
        let dispatcher = Arc::clone(&h.dispatcher);
        let cmd = create(20, explicit_local(9_000, 9_010), OWNER);
        tokio::spawn(async move { dispatcher.dispatch(cmd).await })
    };
    h.policy.wait_at_gate().await;

    let check = command(
        CommandType::CheckAccess,
        json!({"ip": "127.0.0.1", "port": 9_001, "object": "bucket"}),
        STRANGER,
    );
    let reply = match tokio::time::timeout(Duration::from_secs(5), h.dispatcher.dispatch(check)).await {
        Ok(reply) => reply,
        Err(_) => panic!("check waited on an unrelated registration"),
    };
    assert_eq!(reply, Response::ok("granted"));
    assert!(h.policy.calls().iter().any(|c| c.starts_with("can_access") && c.ends_with("bucket ")));

    let overlapping = h.dispatcher.dispatch(create(21, explicit_local(9_005, 9_020), OWNER));
    let info = match tokio::time::timeout(Duration::from_secs(5), overlapping).await {
        Ok(reply) => failure(reply),
        Err(_) => panic!("overlap check waited on an unrelated registration"),
    };
    assert!(info.contains("pending principal 20"), "{info}");

    h.policy.open_gate();
    let created = match creating.await {
        Ok(reply) => principal(reply),
        Err(err) => panic!("create task panicked: {err}"),
    };
    assert_eq!(created.id, 20);
    assert!(h.dispatcher.has_principal(20).await);
}

#[tokio::test]
async fn failed_registration_returns_pooled_ports() {
    let h = harness();
    h.policy.fail_register(true);

    let info = failure(h.dispatcher.dispatch(create(9, pooled(100), OWNER)).await);
    assert!(info.contains("500"), "{info}");
    assert!(!h.dispatcher.has_principal(9).await);

    h.policy.fail_register(false);
    let p = principal(h.dispatcher.dispatch(create(9, pooled(100), OWNER)).await);
    assert_eq!((p.port_lo, p.port_hi), (20_000, 20_100));
}

#[tokio::test]
async fn bearer_is_hidden_from_other_callers() {
    let h = harness();
    let created = principal(h.dispatcher.dispatch(create(11, pooled(2), OWNER)).await);
    let query = json!({"ip": "127.0.0.1", "port": created.port_lo});

    let seen_by_owner =
        principal(h.dispatcher.dispatch(command(CommandType::GetPrincipal, query.clone(), OWNER)).await);
    assert_eq!(seen_by_owner.bearer, created.bearer);

    let seen_by_stranger =
        principal(h.dispatcher.dispatch(command(CommandType::GetPrincipal, query, STRANGER)).await);
    assert_eq!(seen_by_stranger.bearer, None);
    assert_eq!(seen_by_stranger.id, 11);

    let local = principal(
        h.dispatcher
            .dispatch(command(CommandType::GetLocalPrincipal, json!({"id": 11, "gn": created.gn}), ROOT))
            .await,
    );
    assert_eq!(local.bearer, created.bearer);
}

#[tokio::test]
async fn legacy_config_string_is_registered_verbatim() {
    let h = harness();
    let mut configs = BTreeMap::new();
    configs.insert(LEGACY_CONFIG_KEY.to_owned(), "mode=strict".to_owned());
    let req = CreatePrincipal {
        id: 12,
        auth: pooled(1),
        code: CodeSpec {
            image: "sha256:img".to_owned(),
            configs,
        },
    };
    let mut cmd = Command::new(CommandType::CreatePrincipal, &req).expect("statement serializes");
    cmd.stamp(OWNER);

    let p = principal(h.dispatcher.dispatch(cmd).await);
    assert_eq!(p.configs, "mode=strict");
}

#[tokio::test]
async fn checks_use_the_bearer_of_the_principal_at_the_address() {
    let h = harness();
    let p = principal(h.dispatcher.dispatch(create(13, pooled(3), OWNER)).await);

    let reply = h
        .dispatcher
        .dispatch(command(
            CommandType::CheckAccess,
            json!({"ip": "127.0.0.1", "port": p.port_lo, "object": "bucket"}),
            STRANGER,
        ))
        .await;
    assert_eq!(reply, Response::ok("granted"));
    assert!(h.policy.calls().iter().any(|c| c.ends_with("bucket bearer-13:0")));

    h.policy.deny(true);
    let reply = h
        .dispatcher
        .dispatch(command(
            CommandType::CheckProperty,
            json!({"ip": "127.0.0.1", "port": 1, "property": "trusted"}),
            STRANGER,
        ))
        .await;
    assert_eq!(reply, Response::fail("denied"));

    let reply = h
        .dispatcher
        .dispatch(command(
            CommandType::CheckAttestation,
            json!({"ip": "127.0.0.1", "port": p.port_lo}),
            STRANGER,
        ))
        .await;
    assert!(matches!(reply, Response::Attestation { .. }));
}

#[tokio::test]
async fn endorsement_family_reaches_the_policy_client() {
    let h = harness();
    let cases = [
        (CommandType::Endorse, json!({"id": "img", "property": "p"}), "endorse_image"),
        (CommandType::Endorse, json!({"id": "src", "kind": "source", "property": "p"}), "endorse_source"),
        (CommandType::EndorseImageProperty, json!({"id": "img", "property": "p"}), "endorse_image"),
        (CommandType::EndorseSourceImage, json!({"id": "img", "property": "git://x"}), "endorse_source"),
        (CommandType::EndorseAttesterImage, json!({"id": "img"}), "endorse_attester"),
        (CommandType::EndorseBuilderImage, json!({"id": "img", "kind": "source"}), "endorse_builder"),
        (
            CommandType::EndorseMembership,
            json!({"ip": "10.1.1.1", "port": 9, "endorsements": [{"property": "worker"}]}),
            "endorse_membership",
        ),
        (CommandType::CheckImageProperty, json!({"image": "img", "property": "p"}), "image_has_property"),
        (CommandType::CheckWorkerAccess, json!({"ip": "10.1.1.1", "port": 9, "object": "o"}), "can_worker_access"),
    ];

    for (kind, statement, method) in cases {
        let before = h.policy.count(method);
        let reply = h.dispatcher.dispatch(command(kind, statement, OWNER)).await;
        assert!(reply.is_success(), "{kind}: {reply:?}");
        assert_eq!(h.policy.count(method), before.saturating_add(1), "{kind}");
    }
}

#[tokio::test]
async fn post_acl_is_persisted_through_the_registry() {
    let h = harness();
    let reply = h
        .dispatcher
        .dispatch(command(
            CommandType::PostAcl,
            json!({"object": "bucket", "requirement": "reader"}),
            OWNER,
        ))
        .await;
    assert!(reply.is_success());
    assert_eq!(h.policy.count("post_acl"), 1);
}

#[tokio::test]
async fn metadata_config_reports_the_policy_url() {
    let h = harness();
    let reply = h
        .dispatcher
        .dispatch(Command::bare(CommandType::GetMetadataConfig))
        .await;
    assert_eq!(
        reply,
        Response::Metadata {
            url: "http://127.0.0.1:7777/".to_owned()
        }
    );
}

#[tokio::test]
async fn unsupported_and_unknown_types_fail_cleanly() {
    let h = harness();

    let info = failure(h.dispatcher.dispatch(Command::bare(CommandType::Revoke)).await);
    assert!(info.contains("REVOKE is not implemented"), "{info}");

    let mut unknown = Command::bare(CommandType::Endorse);
    unknown.kind = 999;
    let info = failure(h.dispatcher.dispatch(unknown).await);
    assert_eq!(info, "unknown command type 999");
}

#[tokio::test]
async fn malformed_statements_are_rejected() {
    let h = harness();

    let info = failure(h.dispatcher.dispatch(Command::bare(CommandType::CreatePrincipal)).await);
    assert!(info.starts_with("malformed statement"), "{info}");

    let info = failure(
        h.dispatcher
            .dispatch(command(CommandType::CreatePrincipal, json!({"id": "one"}), OWNER))
            .await,
    );
    assert!(info.starts_with("malformed statement"), "{info}");

    let info = failure(
        h.dispatcher
            .dispatch(command(
                CommandType::CheckAccess,
                json!({"ip": "300.1.1.1", "port": 1, "object": "o"}),
                OWNER,
            ))
            .await,
    );
    assert!(info.contains("not an IPv4 address"), "{info}");

    let info = failure(h.dispatcher.dispatch(create(14, AuthSpec::default(), OWNER)).await);
    assert!(info.contains("positive nport"), "{info}");
    assert_eq!(h.policy.count("register_principal"), 0);
}
