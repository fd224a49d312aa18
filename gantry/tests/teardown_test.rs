/// Teardown and group discovery against the in-memory Compute Engine

use std::sync::Arc;

use gantry::gce::Instance;
use gantry::{HostSpec, Provisioner, TestGroup};
use gantry_cli_test_utils::*;

fn instance(name: &str) -> Instance {
    Instance {
        name: name.into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_teardown_twice_is_harmless() {
    let env = TestEnv::new("teardown-twice");
    let fake = Arc::new(FakeCompute::new());
    let root = Arc::new(RecordingRootAccess::new());
    let hosts = vec![HostSpec::from_family("primary", "debian-12")];
    let provisioner = env.provisioner(&fake, &root, env.config(hosts.clone()));

    let group = provisioner
        .provision(&hosts)
        .await
        .expect("should provision")
        .into_result()
        .expect("every host should come up");

    let first = provisioner.teardown(&group).await;
    assert!(first.is_clean());
    assert_eq!(first.deleted.len(), 3);

    let second = provisioner.teardown(&group).await;
    assert!(second.is_clean());
    assert!(second.deleted.is_empty());
    assert_eq!(second.missing.len(), 3);
}

#[tokio::test]
async fn test_teardown_of_empty_group_still_removes_firewalls() {
    let env = TestEnv::new("teardown-empty");
    let fake = Arc::new(FakeCompute::new());
    let root = Arc::new(RecordingRootAccess::new());
    let overrides = gantry::Overrides {
        group_id: Some("gantry-00c0ffee".into()),
        ..env.overrides()
    };
    let provisioner = env.provisioner(&fake, &root, env.config_with(overrides, Vec::new()));

    let report = provisioner.provision(&[]).await.expect("should provision");
    assert!(report.is_complete());
    assert!(report.group.hosts.is_empty());
    assert_eq!(fake.firewalls().len(), 2);

    let teardown = provisioner.teardown(&report.group).await;
    assert!(teardown.is_clean());
    assert_eq!(
        teardown.deleted,
        vec![
            "gantry-00c0ffee-external".to_string(),
            "gantry-00c0ffee-internal".to_string()
        ]
    );
    assert_eq!(fake.count("delete_instance"), 0);
}

#[tokio::test]
async fn test_teardown_continues_past_failures() {
    let env = TestEnv::new("teardown-failure");
    let fake = Arc::new(FakeCompute::new());
    let root = Arc::new(RecordingRootAccess::new());
    let hosts = vec![
        HostSpec::from_family("a", "debian-12"),
        HostSpec::from_family("b", "debian-12"),
    ];
    let provisioner = env.provisioner(&fake, &root, env.config(hosts.clone()));

    let group = provisioner
        .provision(&hosts)
        .await
        .expect("should provision")
        .into_result()
        .expect("every host should come up");

    let stuck = group.hosts[0].instance_name.clone();
    fake.inject(Fault::http("delete_firewall", 403, "forbidden").on("-external"));
    fake.inject(Fault::operation("delete_instance", "RESOURCE_IN_USE_BY_ANOTHER_RESOURCE", "in use").on(&stuck));

    let report = provisioner.teardown(&group).await;
    assert!(!report.is_clean());
    assert_eq!(report.failed.len(), 2);
    let failed: Vec<&str> = report.failed.iter().map(|(name, _)| name.as_str()).collect();
    assert!(failed.contains(&group.external_firewall.as_str()));
    assert!(failed.contains(&stuck.as_str()));

    assert!(report.deleted.contains(&group.internal_firewall));
    assert!(report.deleted.contains(&group.hosts[1].instance_name));
}

#[tokio::test]
async fn test_discover_group_finds_instances_by_prefix() {
    let env = TestEnv::new("discover");
    let fake = Arc::new(FakeCompute::new());
    fake.add_instance(instance("gantry-0badf00d-aq3kz9x0b1mtr"));
    fake.add_instance(instance("gantry-0badf00d-bx81hd02kslq7"));
    fake.add_instance(instance("gantry-0badf00dd-c000000000000"));
    fake.add_instance(instance("unrelated-vm"));
    let root = Arc::new(RecordingRootAccess::new());
    let provisioner = env.provisioner(&fake, &root, env.config(Vec::new()));

    let group = provisioner
        .discover_group("gantry-0badf00d")
        .await
        .expect("listing should succeed");

    assert_eq!(group.external_firewall, "gantry-0badf00d-external");
    assert_eq!(group.internal_firewall, "gantry-0badf00d-internal");
    assert_eq!(
        group.instance_names().collect::<Vec<_>>(),
        vec!["gantry-0badf00d-aq3kz9x0b1mtr", "gantry-0badf00d-bx81hd02kslq7"]
    );

    let report = provisioner.teardown(&group).await;
    assert!(report.is_clean());
    assert_eq!(report.deleted.len(), 2);
    assert_eq!(report.missing.len(), 2, "no firewalls were ever created");
    let left: Vec<String> = fake.instances().into_iter().map(|i| i.name).collect();
    assert_eq!(left, vec!["gantry-0badf00dd-c000000000000", "unrelated-vm"]);
}

#[tokio::test]
async fn test_state_file_round_trips_for_later_teardown() {
    let env = TestEnv::new("state-file");
    let fake = Arc::new(FakeCompute::new());
    let root = Arc::new(RecordingRootAccess::new());
    let hosts = vec![HostSpec::from_family("primary", "debian-12")];
    let provisioner = env.provisioner(&fake, &root, env.config(hosts.clone()));

    let group = provisioner
        .provision(&hosts)
        .await
        .expect("should provision")
        .into_result()
        .expect("every host should come up");

    let state = env.path().join("gantry-state.json");
    group.save(&state).expect("should save state");
    let loaded = TestGroup::load(&state).expect("should load state");
    assert_eq!(loaded, group);

    let report = provisioner.teardown(&loaded).await;
    assert!(report.is_clean());
    assert!(fake.instances().is_empty());
}
