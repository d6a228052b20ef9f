//! Integration tests for network and container lookup.
mod common;

use common::{DEFAULT_NETWORK, Harness, network_id};
use tern::runtime::{Container, TaskStatus};
use tern_common::{ErrorKind, TernError};
use tern_network::NetworkConfig;

fn harness_with_prefix_twins() -> Harness {
    let h = Harness::new();
    h.store.insert(
        NetworkConfig::new("front")
            .with_id("7f3c91aa0b1e4d2f9c8a6b5e4d3c2b1a0f9e8d7c6b5a49382716050403020100"),
    );
    h.store.insert(
        NetworkConfig::new("back")
            .with_id("7f3c22bb0b1e4d2f9c8a6b5e4d3c2b1a0f9e8d7c6b5a49382716050403020100"),
    );
    h
}

#[tokio::test]
async fn resolve_by_name_id_and_prefix() {
    let h = harness_with_prefix_twins();
    let full = "7f3c91aa0b1e4d2f9c8a6b5e4d3c2b1a0f9e8d7c6b5a49382716050403020100";

    for query in ["front", full, "7f3c91", "7f3c91aa0b1e"] {
        let network = h.service.inspect(query).await.unwrap();
        assert_eq!(network.name, "front", "query {query}");
    }
}

#[tokio::test]
async fn shared_prefix_is_ambiguous() {
    let h = harness_with_prefix_twins();

    let err = h.service.inspect("7f3c").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Ambiguous);
    assert!(!err.is_not_found());
    let TernError::Ambiguous { matches, .. } = err else {
        panic!("expected an ambiguity error");
    };
    assert_eq!(matches, vec!["front".to_string(), "back".to_string()]);
}

#[tokio::test]
async fn unknown_network_is_not_found() {
    let h = Harness::new();
    let err = h.service.inspect("nope").await.unwrap_err();
    assert!(matches!(err, TernError::NetworkNotFound { .. }));
    assert_eq!(err.to_string(), "No such network: nope");
}

#[tokio::test]
async fn network_without_id_matches_by_name_only() {
    let h = Harness::new();
    h.store.insert(NetworkConfig::new("legacy"));

    assert_eq!(h.service.inspect("legacy").await.unwrap().name, "legacy");
    assert!(h.service.inspect("leg").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn predefined_network_resolves_by_id_prefix() {
    let h = Harness::new();
    let id = network_id(DEFAULT_NETWORK);

    let network = h.service.inspect(&id[..12]).await.unwrap();
    assert_eq!(network.name, DEFAULT_NETWORK);
    assert!(network.is_predefined());
}

#[tokio::test]
async fn containers_resolve_like_networks() {
    let h = Harness::new();
    h.add_container("a1b2c3d4e5f6a7b8", "web-1", None);
    h.add_container("a1b2ffffffffffff", "web-2", Some(TaskStatus::Running));

    assert_eq!(h.service.resolve_container("web-1").await.unwrap().id(), "a1b2c3d4e5f6a7b8");
    assert_eq!(h.service.resolve_container("a1b2c3").await.unwrap().name(), "web-1");

    let err = h
        .service
        .resolve_container("a1b2")
        .await
        .err()
        .expect("shared prefix must not resolve");
    assert_eq!(err.kind(), ErrorKind::Ambiguous);

    let err = h
        .service
        .resolve_container("db-1")
        .await
        .err()
        .expect("unknown container must not resolve");
    assert!(matches!(err, TernError::ContainerNotFound { .. }));
}
