//! 外部存储集成测试 / External store integration tests
//!
//! 仅在设置 `V_TEST_REDIS_URL` / `V_TEST_MONGO_URI` 时运行
//! Run only when `V_TEST_REDIS_URL` / `V_TEST_MONGO_URI` are set.

use anyhow::Result;
use v::ChatMessage;
use v_chat_storage::{new_message_id, ChatStore, MongoChatStore, OfflineQueue, RedisOfflineQueue};

fn test_user_id() -> u32 {
    // 避免并发测试之间的键冲突 / Avoid key clashes between concurrent runs
    4_000_000_000 + (chrono::Utc::now().timestamp_subsec_nanos() % 100_000_000)
}

#[tokio::test]
async fn redis_drain_is_ordered_and_atomic() -> Result<()> {
    let url = match std::env::var("V_TEST_REDIS_URL") {
        Ok(url) => url,
        Err(_) => return Ok(()),
    };
    let queue = RedisOfflineQueue::connect(&url).await?;
    queue.ping().await?;

    let uid = test_user_id();
    queue.drain_all(uid).await?;
    for content in ["one", "two", "three"] {
        queue.push(uid, &ChatMessage::new(1, uid, content).to_frame()?).await?;
    }
    assert_eq!(queue.len(uid).await?, 3);

    let drained = queue.drain_all(uid).await?;
    let contents: Vec<String> = drained
        .iter()
        .map(|raw| ChatMessage::from_frame(raw).map(|m| m.content))
        .collect::<Result<_, _>>()?;
    assert_eq!(contents, vec!["one", "two", "three"]);
    assert_eq!(queue.len(uid).await?, 0);
    assert!(queue.drain_all(uid).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn mongo_records_one_chat_per_pair() -> Result<()> {
    let uri = match std::env::var("V_TEST_MONGO_URI") {
        Ok(uri) => uri,
        Err(_) => return Ok(()),
    };
    let store = MongoChatStore::connect(&uri, "v_chat_test").await?;
    store.ping().await?;
    store.ensure_indexes().await?;

    let (a, b) = (test_user_id(), test_user_id().wrapping_add(1));
    let hi_id = new_message_id();
    let hi = ChatMessage::new(a, b, "hi");
    let first = store.record_message(&hi_id, &hi).await?;
    let second = store.record_message(&new_message_id(), &ChatMessage::new(b, a, "hey")).await?;
    assert_eq!(first.chat_id, second.chat_id);

    let chat = store.find_or_create_chat(b, a).await?;
    assert_eq!(chat.id, first.chat_id);
    assert_eq!(chat.last_message.as_deref(), Some("hey"));
    // 查找已有会话不改动 updated_at / Looking up an existing chat leaves updated_at alone
    let again = store.find_or_create_chat(a, b).await?;
    assert_eq!(again.updated_at, chat.updated_at);

    let recent = store.recent_messages(&chat.id, 10).await?;
    assert_eq!(recent.len(), 2);

    // 同一 id 重放不产生新行 / Replaying the same id writes no new row
    let replay = store.record_message(&hi_id, &hi).await?;
    assert_eq!(replay.id, first.id);
    assert_eq!(store.recent_messages(&chat.id, 10).await?.len(), 2);
    Ok(())
}
