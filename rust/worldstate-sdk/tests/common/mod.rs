#![allow(dead_code)]

use std::time::Duration;
use worldstate_sdk::{Client, ClientConfig, Entity, Felt, MemoryIndexer, Member, Model, Primitive, Ty};

pub const WORLD_A: u64 = 0xa;
pub const WORLD_B: u64 = 0xb;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A `ns-Position` entity keyed by `id` in `world`, stamped at `ts`.
pub fn position(world: u64, id: u64, ts: u64, x: u32) -> Entity {
    Entity::builder(Felt::from(world), Felt::from(id))
        .at(ts)
        .model(Model::new(
            "ns-Position",
            vec![
                Member::key("id", Ty::Primitive(Primitive::U64(id))),
                Member::new("x", Ty::Primitive(Primitive::U32(x))),
            ],
        ))
        .model(Model::new(
            "ns-Moves",
            vec![Member::new("remaining", Ty::Primitive(Primitive::U8(3)))],
        ))
        .build()
        .unwrap()
}

/// An entity whose model payload serializes to at least `bytes` bytes.
pub fn bulky(world: u64, id: u64, bytes: usize) -> Entity {
    Entity::builder(Felt::from(world), Felt::from(id))
        .at(id)
        .model(Model::new(
            "ns-Blob",
            vec![Member::new("data", Ty::ByteArray("x".repeat(bytes)))],
        ))
        .build()
        .unwrap()
}

pub fn seeded(count: u64) -> MemoryIndexer {
    let indexer = MemoryIndexer::new();
    indexer.publish_all((1..=count).map(|id| position(WORLD_A, id, 1000 + id, (id * 7 % 5) as u32)));
    indexer
}

pub async fn connect(indexer: &MemoryIndexer) -> Client {
    connect_with(indexer, ClientConfig::default()).await
}

pub async fn connect_with(indexer: &MemoryIndexer, config: ClientConfig) -> Client {
    init_tracing();
    Client::from_transport(indexer.connect(), config).await.unwrap()
}

pub fn hashed_ids(entities: &[Entity]) -> Vec<Felt> {
    entities.iter().map(|e| e.hashed_keys()).collect()
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
