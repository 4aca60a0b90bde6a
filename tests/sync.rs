//! Sync runner scenarios: check mode, repository tag filtering, and the
//! rate-limit pause.

mod common;

use std::sync::Arc;

use regmirror::sync::{SyncConfig, SyncRunner};
use regmirror::RegClient;
use tokio_util::sync::CancellationToken;

use common::registry::{MockRegistry, RegistryState};
use common::{plain_host, seed_image};

fn runner_for(mock_hosts: Vec<regmirror::registry::HostConfig>, yaml: &str) -> SyncRunner {
    let mut config = SyncConfig::load_reader(yaml.as_bytes()).unwrap();
    config.defaults.skip_docker_conf = true;
    let client = RegClient::builder()
        .hosts(mock_hosts)
        .retry(
            3,
            std::time::Duration::from_millis(10),
            std::time::Duration::from_millis(100),
        )
        .build();
    SyncRunner::with_client(config, Arc::new(client))
}

#[tokio::test]
async fn check_then_copy_then_match() {
    let mut state = RegistryState::default();
    seed_image(&mut state, "a/img", "1");
    let mock = MockRegistry::spawn_with(state);
    let cancel = CancellationToken::new();

    let yaml = format!(
        r#"
sync:
  - source: {host}/a/img:1
    target: {host}/b/img:1
    type: image
"#,
        host = mock.host()
    );
    let runner = runner_for(vec![plain_host(&mock.host())], &yaml);

    // dry-run reports work to do and copies nothing
    assert!(runner.run_check(&cancel).await.unwrap());
    assert!(!mock
        .state
        .lock()
        .unwrap()
        .manifests
        .contains_key(&("b/img".to_string(), "1".to_string())));

    runner.run_once(&cancel).await.unwrap();
    assert!(mock
        .state
        .lock()
        .unwrap()
        .manifests
        .contains_key(&("b/img".to_string(), "1".to_string())));

    // now the digests match and nothing is needed
    assert!(!runner.run_check(&cancel).await.unwrap());
}

#[tokio::test]
async fn repository_step_filters_tags() {
    let mut state = RegistryState::default();
    seed_image(&mut state, "a/img", "v1.0");
    seed_image(&mut state, "a/img", "v1.0-rc.1");
    seed_image(&mut state, "a/img", "v2.0");
    seed_image(&mut state, "a/img", "dev");
    let mock = MockRegistry::spawn_with(state);
    let cancel = CancellationToken::new();

    let yaml = format!(
        r#"
sync:
  - source: {host}/a/img
    target: {host}/b/img
    type: repository
    tags:
      allow:
        - "v1.*"
        - "v2.*"
      deny:
        - "v1.0-rc.*"
"#,
        host = mock.host()
    );
    let runner = runner_for(vec![plain_host(&mock.host())], &yaml);
    runner.run_once(&cancel).await.unwrap();

    let st = mock.state.lock().unwrap();
    let copied: Vec<&str> = ["v1.0", "v1.0-rc.1", "v2.0", "dev"]
        .into_iter()
        .filter(|tag| st.manifests.contains_key(&("b/img".to_string(), tag.to_string())))
        .collect();
    assert_eq!(copied, vec!["v1.0", "v2.0"]);
}

#[tokio::test]
async fn rate_limit_pause_then_proceed() {
    let mut state = RegistryState::default();
    seed_image(&mut state, "a/img", "1");
    // first gate check sees a depleted budget, the recheck a refilled one
    state.ratelimit_remaining = [50, 50, 200].into_iter().collect();
    let mock = MockRegistry::spawn_with(state);
    let cancel = CancellationToken::new();

    let yaml = format!(
        r#"
sync:
  - source: {host}/a/img:1
    target: {host}/b/img:1
    type: image
    rateLimit:
      min: 100
      retry: 1
"#,
        host = mock.host()
    );
    let runner = runner_for(vec![plain_host(&mock.host())], &yaml);

    let started = std::time::Instant::now();
    runner.run_once(&cancel).await.unwrap();
    // one pause of rateLimit.retry seconds happened before the copy
    assert!(started.elapsed() >= std::time::Duration::from_secs(1));

    let st = mock.state.lock().unwrap();
    assert!(st
        .manifests
        .contains_key(&("b/img".to_string(), "1".to_string())));
    // the source was re-checked until the budget recovered
    assert!(st.requests_matching("/a/img/manifests/1").len() >= 3);
}

#[tokio::test]
async fn first_error_does_not_stop_other_steps() {
    let mut state = RegistryState::default();
    seed_image(&mut state, "a/img", "1");
    let mock = MockRegistry::spawn_with(state);
    let cancel = CancellationToken::new();

    let yaml = format!(
        r#"
sync:
  - source: {host}/missing/img:1
    target: {host}/b/img:1
    type: image
  - source: {host}/a/img:1
    target: {host}/c/img:1
    type: image
"#,
        host = mock.host()
    );
    let runner = runner_for(vec![plain_host(&mock.host())], &yaml);

    // the bad step surfaces as the run error
    let result = runner.run_once(&cancel).await;
    assert!(result.is_err());
    // but the good step still completed
    assert!(mock
        .state
        .lock()
        .unwrap()
        .manifests
        .contains_key(&("c/img".to_string(), "1".to_string())));
}
