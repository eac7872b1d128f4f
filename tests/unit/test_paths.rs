//! Resolver derivation tests across successive blue/green cutovers.

use std::path::Path;
use std::sync::Arc;

use cicd_agent::config::Settings;
use cicd_agent::paths::{Mode, Resolver};
use cicd_agent::version::{Colour, VersionLedger};

fn make_resolver(base: &Path, ledger: Arc<VersionLedger>) -> Resolver {
    let mut settings = Settings::default();
    settings
        .deployment
        .double
        .insert("p".to_string(), base.to_string_lossy().into_owned());
    settings
        .deployment
        .single
        .insert("plain".to_string(), base.to_string_lossy().into_owned());
    Resolver::new(Arc::new(settings), ledger)
}

#[tokio::test]
async fn test_first_deployment_lands_on_v1() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = make_resolver(dir.path(), Arc::new(VersionLedger::new()));

    // no .current file: next must resolve to v1, not the opposite of a
    // freshly created default
    assert_eq!(resolver.colour("p", Mode::Next).await.unwrap(), Colour::V1);
    assert_eq!(
        resolver.namespace("p", Mode::Next).await.unwrap(),
        "p-service-v1"
    );
    assert!(!dir.path().join(".current").exists());
}

#[tokio::test]
async fn test_successive_cutovers_alternate_colours() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(VersionLedger::new());
    let resolver = make_resolver(dir.path(), ledger.clone());

    // first rollout goes to v1, cutover records it live
    let first = resolver.colour("p", Mode::Next).await.unwrap();
    assert_eq!(first, Colour::V1);
    ledger.set_live_colour(dir.path(), first).await.unwrap();

    // second rollout targets the opposite colour
    let second = resolver.colour("p", Mode::Next).await.unwrap();
    assert_eq!(second, Colour::V2);
    assert_eq!(
        resolver.deployment_dir("p", Mode::Next).await.unwrap(),
        dir.path().join("deployment-v2")
    );
    ledger.set_live_colour(dir.path(), second).await.unwrap();

    // and the third flips back
    assert_eq!(resolver.colour("p", Mode::Next).await.unwrap(), Colour::V1);
    assert_eq!(
        resolver.namespace("p", Mode::Now).await.unwrap(),
        "p-service-v2"
    );
}

#[tokio::test]
async fn test_single_projects_ignore_the_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(VersionLedger::new());
    ledger.set_live_colour(dir.path(), Colour::V2).await.unwrap();

    let resolver = make_resolver(dir.path(), ledger);
    assert_eq!(
        resolver.namespace("plain", Mode::Now).await.unwrap(),
        "plain-service"
    );
    assert_eq!(
        resolver.deployment_dir("plain", Mode::Next).await.unwrap(),
        dir.path().join("deployment")
    );
}

#[tokio::test]
async fn test_unconfigured_project_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = make_resolver(dir.path(), Arc::new(VersionLedger::new()));
    assert!(resolver.namespace("ghost", Mode::Now).await.is_err());
    assert!(resolver.deployment_dir("ghost", Mode::Next).await.is_err());
}
