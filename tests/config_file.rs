use tokio_test::assert_ok;
use voxroom::config::Config;

#[tokio::test]
async fn default_file_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let path = path.to_str().unwrap();
    assert_ok!(Config::create_default(path).await);
    let config = assert_ok!(Config::load(path).await);
    assert_eq!(config.flood.threshold(), 12);
    assert_eq!(config.server.default_channel, Config::default().server.default_channel);
}

#[tokio::test]
async fn partial_file_fills_in_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("voxroom.toml");
    std::fs::write(
        &path,
        r#"
[server]
bind = "127.0.0.1:9000"

[privileges]
moderators = ["secret-mod"]

[events.tunnel]
period_mins = 10.0
"#,
    )
    .unwrap();
    let config = assert_ok!(Config::load(path.to_str().unwrap()).await);
    assert_eq!(config.server.bind, "127.0.0.1:9000");
    assert_eq!(config.privileges.moderators, vec!["secret-mod".to_string()]);
    assert_eq!(config.events.tunnel.period_mins, 10.0);
    assert_eq!(config.events.tunnel.std_dev_mins, None);
    assert_eq!(config.flood.window_secs, 4);
}

#[tokio::test]
async fn invalid_pattern_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[moderation]\nbanned_words = [\"(unclosed\"]\n").unwrap();
    assert!(Config::load(path.to_str().unwrap()).await.is_err());
}

#[tokio::test]
async fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nope.toml");
    assert!(Config::load(path.to_str().unwrap()).await.is_err());
}
