mod common;

use std::time::Duration;

use alloy_primitives::B256;
use common::*;
use rollup_primitives::message::BroadcastFeedMessage;
use rollup_streamer::config::test_config;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn pump_digests_messages_in_order() {
    let t = setup(test_config());
    t.streamer
        .add_messages(0, true, vec![init_msg(), plain_msg(1, b"a"), plain_msg(1, b"b")])
        .await
        .unwrap();

    // Head starts at 0, so message 1 is next; one more remains after it.
    assert!(t.streamer.execute_next_msg().await);
    assert!(!t.streamer.execute_next_msg().await);
    assert!(!t.streamer.execute_next_msg().await);

    assert_eq!(t.engine.digested.lock().unwrap().as_slice(), &[1, 2]);
    let calls = t.broadcast.calls.lock().unwrap().clone();
    assert!(calls.contains(&(1, 1)));
    assert!(calls.contains(&(2, 1)));
}

#[tokio::test]
async fn mismatched_feed_hash_is_logged_not_fatal() {
    let t = setup(test_config());
    t.streamer
        .add_messages(0, true, vec![init_msg(), plain_msg(1, b"a")])
        .await
        .unwrap();

    // A feed message whose claimed hash disagrees with what the engine
    // will compute.
    t.streamer
        .add_broadcast_messages(vec![BroadcastFeedMessage {
            sequence_number: 2,
            message: plain_msg(1, b"b"),
            block_hash: Some(B256::repeat_byte(0xde)),
        }])
        .await
        .unwrap();
    assert_eq!(t.streamer.get_message_count().unwrap(), 3);

    while t.streamer.execute_next_msg().await {}
    assert_eq!(t.engine.digested.lock().unwrap().as_slice(), &[1, 2]);
}

#[tokio::test]
async fn pump_loop_drains_new_messages_until_cancelled() {
    let t = setup(test_config());
    let token = CancellationToken::new();
    t.streamer.start(token.clone());

    t.streamer
        .add_messages(0, true, vec![init_msg(), plain_msg(1, b"a"), plain_msg(1, b"b")])
        .await
        .unwrap();

    let mut drained = false;
    for _ in 0..200 {
        if t.engine.digested.lock().unwrap().as_slice() == [1, 2] {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    token.cancel();
    assert!(drained, "pump loop did not digest the appended messages");
}
