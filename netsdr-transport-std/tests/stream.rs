#![expect(missing_docs, reason = "test")]

use netsdr_transport_api::stream::test_suite;
use netsdr_transport_std::{Inbound, StreamTransportClient};

const IP_ADDRESS: &str = "127.0.0.1";

fn client(host: &str, port: u16) -> (StreamTransportClient, Inbound<Vec<u8>>) {
    StreamTransportClient::new(host, port)
}

#[tokio::test]
async fn stream_receive_on_connect() {
    test_suite::test_receive_on_connect(client, IP_ADDRESS, 50000).await;
}

#[tokio::test]
async fn stream_connect_twice() {
    test_suite::test_connect_twice(client, IP_ADDRESS, 50100).await;
}

#[tokio::test]
async fn stream_send_without_connection() {
    test_suite::test_send_without_connection(client, IP_ADDRESS, 50101).await;
}

#[tokio::test]
async fn stream_send_in_order() {
    test_suite::test_send_in_order(client, IP_ADDRESS, 50102).await;
}

#[tokio::test]
async fn stream_connect_refused() {
    test_suite::test_connect_refused(client, IP_ADDRESS, 50103).await;
}

#[tokio::test]
async fn stream_silent_after_disconnect() {
    test_suite::test_silent_after_disconnect(client, IP_ADDRESS, 50104).await;
}

#[tokio::test]
async fn stream_reconnect() {
    test_suite::test_reconnect(client, IP_ADDRESS, 50105).await;
}

#[tokio::test]
async fn stream_peer_close() {
    test_suite::test_peer_close(client, IP_ADDRESS, 50106).await;
}

#[tokio::test]
async fn stream_prompt_shutdown() {
    test_suite::test_prompt_shutdown(client, IP_ADDRESS, 50107).await;
}
