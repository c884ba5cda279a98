mod common;

use common::*;
use std::collections::HashSet;
use worldstate_sdk::{
    Clause, Client, ClientConfig, ClientError, ComparisonOperator, Felt, MemberValue,
    MemoryIndexer, OrderBy, PaginationDirection, Primitive, Query,
};

async fn walk(client: &Client, query: Query) -> Vec<Vec<Felt>> {
    let mut pages = Vec::new();
    let mut query = query;
    loop {
        let page = client.execute(&query).await.unwrap();
        assert!(page.items.len() <= query.pagination.limit as usize);
        pages.push(hashed_ids(&page.items));
        match page.next_cursor {
            Some(cursor) => query = query.with_cursor(Some(cursor)),
            None => return pages,
        }
    }
}

#[tokio::test]
async fn test_limit_five_over_twelve_yields_five_five_two() {
    let indexer = seeded(12);
    let client = connect(&indexer).await;

    let pages = walk(&client, Query::new().with_limit(5)).await;
    let sizes: Vec<usize> = pages.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![5, 5, 2]);
}

#[tokio::test]
async fn test_following_cursors_covers_every_entity_once() {
    let indexer = seeded(23);
    let client = connect(&indexer).await;

    for order in [OrderBy::asc("updated_at"), OrderBy::desc("ns-Position.x")] {
        let query = Query::new().with_limit(4).with_order_by(order);
        let seen: Vec<Felt> = walk(&client, query).await.into_iter().flatten().collect();
        let unique: HashSet<Felt> = seen.iter().copied().collect();
        assert_eq!(seen.len(), 23);
        assert_eq!(unique.len(), 23);
    }
}

#[tokio::test]
async fn test_backward_walk_mirrors_forward_walk() {
    let indexer = seeded(17);
    let client = connect(&indexer).await;
    let query = Query::new()
        .with_limit(5)
        .with_order_by(OrderBy::desc("ns-Position.x"));

    let forward: Vec<Felt> = walk(&client, query.clone()).await.into_iter().flatten().collect();

    let mut backward_pages = walk(&client, query.with_direction(PaginationDirection::Backward)).await;
    assert_eq!(backward_pages[0].len(), 5);
    assert_eq!(backward_pages.last().map(Vec::len), Some(2));
    backward_pages.reverse();
    let backward: Vec<Felt> = backward_pages.into_iter().flatten().collect();

    assert_eq!(forward, backward);
}

#[tokio::test]
async fn test_cursor_can_switch_direction() {
    let indexer = seeded(10);
    let client = connect(&indexer).await;
    let query = Query::new().with_limit(4);

    let first = client.execute(&query).await.unwrap();
    let second = client
        .execute(&query.clone().with_cursor(first.next_cursor.clone()))
        .await
        .unwrap();
    let back = client
        .execute(
            &query
                .with_direction(PaginationDirection::Backward)
                .with_cursor(first.next_cursor),
        )
        .await
        .unwrap();

    assert_eq!(hashed_ids(&back.items), hashed_ids(&first.items));
    assert!(back.is_last());
    assert_eq!(second.items[0].hashed_keys(), Felt::from(5u64));
}

#[tokio::test]
async fn test_fetch_all_matches_single_large_page() {
    let indexer = seeded(31);
    let client = connect(&indexer).await;
    let order = OrderBy::asc("ns-Position.x");

    let everything = client
        .execute(&Query::new().with_limit(100).with_order_by(order.clone()))
        .await
        .unwrap();
    let paged = client
        .fetch_all(Query::new().with_limit(6).with_order_by(order.clone()))
        .await
        .unwrap();
    let paged_back = client
        .fetch_all(
            Query::new()
                .with_limit(6)
                .with_order_by(order)
                .with_direction(PaginationDirection::Backward),
        )
        .await
        .unwrap();

    assert_eq!(everything.items.len(), 31);
    assert_eq!(paged, everything.items);
    assert_eq!(paged_back, everything.items);
}

#[tokio::test]
async fn test_cursor_replayed_against_other_query_is_rejected_locally() {
    let indexer = seeded(8);
    let client = connect(&indexer).await;

    let page = client.execute(&Query::new().with_limit(3)).await.unwrap();
    let served = indexer.queries_served();

    let other = Query::new()
        .with_limit(3)
        .with_clause(Clause::hashed_keys([Felt::from(2u64)]))
        .with_cursor(page.next_cursor.clone());
    assert!(matches!(client.execute(&other).await, Err(ClientError::InvalidCursor(_))));

    let garbage = Query::new().with_cursor(Some("not-a-cursor".to_string()));
    assert!(matches!(client.execute(&garbage).await, Err(ClientError::InvalidCursor(_))));

    assert_eq!(indexer.queries_served(), served);
}

#[tokio::test]
async fn test_zero_limit_is_rejected_without_a_round_trip() {
    let indexer = seeded(3);
    let client = connect(&indexer).await;

    let err = client.execute(&Query::new().with_limit(0)).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidQuery(_)));
    assert!(!err.is_retryable());

    let err = client
        .execute(&Query::new().with_clause(Clause::or(vec![])))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidQuery(_)));
    assert_eq!(indexer.queries_served(), 0);
}

#[tokio::test]
async fn test_empty_result_has_no_cursor() {
    let indexer = seeded(5);
    let client = connect(&indexer).await;

    let page = client
        .execute(&Query::new().with_world(Felt::from(WORLD_B)))
        .await
        .unwrap();
    assert!(page.items.is_empty());
    assert!(page.is_last());
}

#[tokio::test]
async fn test_member_clause_filters_server_side() {
    let indexer = seeded(20);
    let client = connect(&indexer).await;
    let clause = Clause::member(
        "ns-Position",
        "x",
        ComparisonOperator::Gte,
        MemberValue::Primitive(Primitive::U32(3)),
    );

    let page = client
        .execute(&Query::new().with_clause(clause))
        .await
        .unwrap();
    assert!(!page.items.is_empty());
    for entity in &page.items {
        let x = entity
            .model("ns-Position")
            .and_then(|m| m.member("x"))
            .and_then(|m| m.ty.as_primitive())
            .and_then(|p| p.as_i128())
            .unwrap();
        assert!(x >= 3);
    }
}

#[tokio::test]
async fn test_latest_state_unless_historical() {
    let indexer = MemoryIndexer::new();
    indexer.publish(position(WORLD_A, 1, 10, 0));
    indexer.publish(position(WORLD_A, 1, 20, 4));
    indexer.publish(position(WORLD_A, 2, 15, 1));
    let client = connect(&indexer).await;

    let latest = client.execute(&Query::new()).await.unwrap();
    assert_eq!(latest.items.len(), 2);
    assert_eq!(latest.items[0].updated_at(), 20);

    let history = client.execute(&Query::new().historical(true)).await.unwrap();
    assert_eq!(history.items.len(), 3);
}

#[tokio::test]
async fn test_model_selection_and_hidden_keys() {
    let indexer = seeded(4);
    let client = connect(&indexer).await;

    let page = client
        .execute(&Query::new().with_model("ns-Moves").no_hashed_keys(true))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 4);
    for entity in &page.items {
        assert_eq!(entity.models().len(), 1);
        assert_eq!(entity.models()[0].name, "ns-Moves");
        assert!(entity.hashed_keys().is_zero());
    }
}

#[tokio::test]
async fn test_event_messages_use_their_own_index() {
    let indexer = seeded(6);
    indexer.publish_event_message(position(WORLD_B, 99, 5, 0));
    let client = connect(&indexer).await;

    let events = client.event_messages(&Query::new()).await.unwrap();
    assert_eq!(hashed_ids(&events.items), vec![Felt::from(99u64)]);
    assert_eq!(client.execute(&Query::new()).await.unwrap().items.len(), 6);
}

#[tokio::test]
async fn test_oversized_response_fails_only_that_request() {
    let indexer = MemoryIndexer::new();
    indexer.publish_all((1..=8).map(|id| bulky(WORLD_A, id, 1000)));
    let client = connect_with(&indexer, ClientConfig::default().with_max_message_size(4096)).await;

    match client.execute(&Query::new().with_limit(8)).await {
        Err(ClientError::ResponseTooLarge { size, max }) => {
            assert_eq!(max, 4096);
            assert!(size > max);
        }
        other => panic!("expected ResponseTooLarge, got {other:?}"),
    }

    let small = client.execute(&Query::new().with_limit(1)).await.unwrap();
    assert_eq!(small.items.len(), 1);
}
