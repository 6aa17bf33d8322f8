mod common;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::Message;

use common::{start, test_config};
use voxroom::chat::transport::Listener;

async fn serve() -> String {
    let config = test_config();
    let transport = Listener::new(&config.server);
    let handle = start(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(transport.serve(listener, handle));
    format!("ws://{}", addr)
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await.expect("frame").expect("ok") {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn first_visit_gets_a_cookie_and_the_room() {
    let base = serve().await;
    let (mut ws, response) = tokio_tungstenite::connect_async(format!("{}/socket/Garden", base))
        .await
        .unwrap();
    let cookie = response
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .expect("cookie");
    assert!(cookie.starts_with("id="));

    let list = next_json(&mut ws).await;
    assert_eq!(list["type"], "userlist");
    assert_eq!(list["users"].as_array().map(Vec::len), Some(1));
    assert_eq!(next_json(&mut ws).await["type"], "backlog");

    ws.send(Message::Text(r#"{"type": "msg", "msg": "bonjour"}"#.into()))
        .await
        .unwrap();
    let msg = next_json(&mut ws).await;
    assert_eq!(msg["type"], "msg");
    assert_eq!(msg["msg"], "bonjour");
}

#[tokio::test]
async fn returning_cookie_keeps_the_persona() {
    let base = serve().await;
    let request = || {
        let mut request = format!("{}/socket/garden", base).into_client_request().unwrap();
        request.headers_mut().insert("cookie", "id=regular".parse().unwrap());
        request
    };
    let (mut first, response) = tokio_tungstenite::connect_async(request()).await.unwrap();
    assert!(response.headers().get("set-cookie").is_none());
    let users = next_json(&mut first).await["users"].clone();
    let (mut second, _) = tokio_tungstenite::connect_async(request()).await.unwrap();
    // second tab of the same user: still one entry
    assert_eq!(next_json(&mut second).await["users"], users);
}

#[tokio::test]
async fn garbage_closes_with_malformed_code() {
    let base = serve().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{}/socket/garden", base))
        .await
        .unwrap();
    next_json(&mut ws).await;
    next_json(&mut ws).await;
    ws.send(Message::Text("{{{".into())).await.unwrap();
    loop {
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(frame.code, WsCloseCode::from(4001));
                break;
            }
            Some(Ok(_)) => continue,
            other => panic!("expected a close frame, got {:?}", other),
        }
    }
}
