//! Registry operations against a recording policy client.

use std::net::Ipv4Addr;
use std::sync::Arc;

use attguard::ports::PortRange;
use attguard::registry::RegistryError;

use crate::support::{registry, CountingKernel, RecordingPolicy};

#[tokio::test]
async fn create_principal_allocates_and_registers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = CountingKernel::new(10_000, 10_100);
    let policy = RecordingPolicy::new();
    let reg = registry(&dir.path().join("state.json"), kernel.clone(), policy.clone());

    let principal = match reg.create_principal(0x2a, "img", "cfg", 10).await {
        Ok(p) => p,
        Err(err) => panic!("create should succeed: {err}"),
    };

    assert_eq!(principal.ports, PortRange { lo: 10_090, hi: 10_100 });
    assert_eq!(principal.bearer, "bearer-42:0");
    assert_eq!(kernel.reserves_for(0x2a), 1);
    assert!(reg.has_principal(0x2a));
    assert_eq!(reg.principal_at(Ipv4Addr::LOCALHOST, 10_095), Some(principal));
    assert_eq!(reg.pending_changes(), 1);
    assert_eq!(policy.count("register_principal"), 1);
}

#[tokio::test]
async fn duplicate_id_is_rejected_without_a_remote_call() {
    let dir = tempfile::tempdir().expect("tempdir");
    let policy = RecordingPolicy::new();
    let reg = registry(
        &dir.path().join("state.json"),
        CountingKernel::new(10_000, 10_100),
        policy.clone(),
    );

    assert!(reg.create_principal(1, "img", "", 5).await.is_ok());
    let err = reg.create_principal(1, "img", "", 5).await.err();
    assert!(matches!(err, Some(RegistryError::AlreadyExists { .. })));
    assert_eq!(err.map(|e| e.code()), Some(-5));
    assert_eq!(policy.count("register_principal"), 1);
}

#[tokio::test]
async fn failed_registration_leaves_nothing_behind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = CountingKernel::new(10_000, 10_100);
    let policy = RecordingPolicy::new();
    policy.fail_register(true);
    let reg = registry(&dir.path().join("state.json"), kernel.clone(), policy.clone());

    let err = reg.create_principal(5, "img", "", 20).await.err();
    assert_eq!(err.map(|e| e.code()), Some(-4));
    assert!(!reg.has_principal(5));
    assert!(!reg.ports().is_allocated(PortRange { lo: 10_000, hi: 10_100 }));
    assert_eq!(kernel.owner_of(10_099), None);
    assert_eq!(reg.pending_changes(), 0);
}

#[tokio::test]
async fn exhausted_pool_maps_to_its_own_code() {
    let dir = tempfile::tempdir().expect("tempdir");
    let policy = RecordingPolicy::new();
    let reg = registry(
        &dir.path().join("state.json"),
        CountingKernel::new(10_000, 10_010),
        policy.clone(),
    );

    let err = reg.create_principal(5, "img", "", 11).await.err();
    assert_eq!(err.map(|e| e.code()), Some(-6));
    assert_eq!(policy.count("register_principal"), 0);
}

#[tokio::test]
async fn delete_retracts_then_releases() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = CountingKernel::new(10_000, 10_100);
    let policy = RecordingPolicy::new();
    let reg = registry(&dir.path().join("state.json"), kernel.clone(), policy.clone());

    let p = match reg.create_principal(3, "img", "", 10).await {
        Ok(p) => p,
        Err(err) => panic!("create should succeed: {err}"),
    };
    assert!(reg.delete_principal(3).await.is_ok());

    assert!(!reg.has_principal(3));
    assert!(!reg.ports().is_allocated(p.ports));
    assert_eq!(kernel.owner_of(p.ports.lo), None);
    assert_eq!(policy.count("retract_principal"), 1);
    assert!(matches!(
        reg.delete_principal(3).await,
        Err(RegistryError::NotFound { .. })
    ));
}

#[tokio::test]
async fn failed_retraction_keeps_the_principal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let policy = RecordingPolicy::new();
    let reg = registry(
        &dir.path().join("state.json"),
        CountingKernel::new(10_000, 10_100),
        policy.clone(),
    );

    let p = match reg.create_principal(3, "img", "", 10).await {
        Ok(p) => p,
        Err(err) => panic!("create should succeed: {err}"),
    };
    policy.fail_retract(true);
    assert!(reg.delete_principal(3).await.is_err());
    assert_eq!(reg.principal(3), Some(p.clone()));
    assert!(reg.ports().is_allocated(p.ports));
}

#[tokio::test]
async fn create_during_a_pending_delete_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = CountingKernel::new(10_000, 10_100);
    let policy = RecordingPolicy::new();
    let reg = Arc::new(registry(&dir.path().join("state.json"), kernel.clone(), policy.clone()));

    let first = match reg.create_principal(5, "img", "", 10).await {
        Ok(p) => p,
        Err(err) => panic!("create should succeed: {err}"),
    };

    policy.fail_retract(true);
    policy.close_gate();
    let deleting = {
        let reg = Arc::clone(&reg);
        tokio::spawn(async move { reg.delete_principal(5).await })
    };
    policy.wait_at_gate().await;

    let second = reg.create_principal(5, "img", "", 10).await;
    assert!(matches!(second, Err(RegistryError::AlreadyExists { .. })), "{second:?}");
    let again = reg.delete_principal(5).await.err();
    assert!(matches!(again, Some(RegistryError::Busy { .. })), "{again:?}");
    assert_eq!(again.map(|e| e.code()), Some(-5));

    policy.open_gate();
    let deleted = match deleting.await {
        Ok(result) => result,
        Err(err) => panic!("delete task panicked: {err}"),
    };
    assert!(deleted.is_err());

    assert_eq!(reg.principal(5), Some(first.clone()));
    assert!(reg.ports().is_allocated(first.ports));
    assert!(!reg.ports().is_allocated(PortRange { lo: 10_000, hi: 10_090 }));
    assert_eq!(policy.count("register_principal"), 1);

    policy.fail_retract(false);
    policy.open_gate();
    assert!(reg.delete_principal(5).await.is_ok());
    assert!(!reg.ports().is_allocated(first.ports));
}

#[tokio::test]
async fn delete_during_a_pending_create_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let policy = RecordingPolicy::new();
    let reg = Arc::new(registry(
        &dir.path().join("state.json"),
        CountingKernel::new(10_000, 10_100),
        policy.clone(),
    ));

    policy.close_gate();
    let creating = {
        let reg = Arc::clone(&reg);
        tokio::spawn(async move { reg.create_principal(8, "img", "", 4).await })
    };
    policy.wait_at_gate().await;

    let early = reg.delete_principal(8).await.err();
    assert!(matches!(early, Some(RegistryError::Busy { .. })), "{early:?}");
    assert_eq!(policy.count("retract_principal"), 0);

    policy.open_gate();
    let created = match creating.await {
        Ok(Ok(p)) => p,
        Ok(Err(err)) => panic!("create should succeed: {err}"),
        Err(err) => panic!("create task panicked: {err}"),
    };
    assert_eq!(reg.principal(8).map(|p| p.bearer), Some(created.bearer));
}

#[tokio::test]
async fn images_are_registered_and_endorsed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let policy = RecordingPolicy::new();
    let reg = registry(
        &dir.path().join("state.json"),
        CountingKernel::new(10_000, 10_100),
        policy.clone(),
    );

    assert!(reg
        .create_image("sha256:ab", "https://git.example/repo", "r1", "cfg")
        .await
        .is_ok());
    assert!(matches!(
        reg.create_image("sha256:ab", "", "", "").await,
        Err(RegistryError::AlreadyExists { .. })
    ));
    assert!(reg.endorse_image("sha256:ab", "reviewed").await.is_ok());
    assert!(matches!(
        reg.endorse_image("sha256:cd", "reviewed").await,
        Err(RegistryError::NotFound { .. })
    ));

    let image = reg.image("sha256:ab").expect("image is stored");
    assert!(image.endorsements.contains("reviewed"));
    assert_eq!(
        policy.calls().last().map(String::as_str),
        Some("endorse_image attguard sha256:ab cfg reviewed")
    );
}

#[tokio::test]
async fn acl_posts_accumulate_and_roll_back_on_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let policy = RecordingPolicy::new();
    let reg = registry(
        &dir.path().join("state.json"),
        CountingKernel::new(10_000, 10_100),
        policy.clone(),
    );

    assert!(reg.post_object_acl("bucket", "reader").await.is_ok());
    assert!(reg.post_object_acl("bucket", "writer").await.is_ok());

    policy.fail_acl(true);
    assert!(reg.post_object_acl("bucket", "admin").await.is_err());
    assert!(reg.post_object_acl("other", "reader").await.is_err());

    let acls: Vec<String> = reg
        .accessor("bucket")
        .map(|o| o.acls.into_iter().collect())
        .unwrap_or_default();
    assert_eq!(acls, vec!["reader".to_owned(), "writer".to_owned()]);
    assert!(!reg.has_accessor("other"));
}

#[tokio::test]
async fn queries_forward_the_local_bearer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let policy = RecordingPolicy::new();
    let reg = registry(
        &dir.path().join("state.json"),
        CountingKernel::new(10_000, 10_100),
        policy.clone(),
    );
    let p = match reg.create_principal(9, "img", "", 4).await {
        Ok(p) => p,
        Err(err) => panic!("create should succeed: {err}"),
    };

    let ip = Ipv4Addr::LOCALHOST;
    assert_eq!(reg.attest_property(ip, p.ports.lo, "trusted").await.ok(), Some(true));
    policy.deny(true);
    assert_eq!(reg.check_access(ip, p.ports.lo, "bucket").await.ok(), Some(false));
    assert!(policy
        .calls()
        .iter()
        .any(|c| c.ends_with("bucket bearer-9:0")));

    assert!(matches!(
        reg.check_access(ip, p.ports.hi, "bucket").await,
        Err(RegistryError::NotFound { .. })
    ));
}
