use model::{
    ChatCompletionsAdapter, JudgeConfig, JudgeDispatcher, JudgeScore, ModelConfig, ModelSettings,
    ProviderFamily, ProviderRegistry, Scorer,
};
use std::sync::Arc;
use std::time::Duration;

fn judge_config() -> JudgeConfig {
    JudgeConfig::default().with_timeout(Duration::from_secs(5))
}

fn reply(content: &str) -> String {
    serde_json::json!({
        "choices": [{"message": {"role": "assistant", "content": content}}]
    })
    .to_string()
}

#[tokio::test]
async fn test_dispatcher_skips_failing_and_unknown_candidates() {
    let mut server = mockito::Server::new_async().await;
    let broken = server
        .mock("POST", "/broken/chat/completions")
        .with_status(503)
        .expect(1)
        .create_async()
        .await;
    let healthy = server
        .mock("POST", "/healthy/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(reply(r#"{"score": "64"}"#))
        .expect(2)
        .create_async()
        .await;

    let settings = |path: &str| {
        ModelSettings::new()
            .with_endpoint(format!("{}{}", server.url(), path))
            .with_api_key("sk-test")
            .with_model_name("judge")
    };
    let candidates = vec![
        ModelConfig::from_provider_name("first", "openai", settings("/broken/chat/completions")),
        ModelConfig::from_provider_name("mystery", "someone-else", settings("/healthy/chat/completions")),
        ModelConfig::from_provider_name("second", "aliyun_bailian", settings("/healthy/chat/completions")),
    ];

    let dispatcher = JudgeDispatcher::new(ProviderRegistry::with_defaults(judge_config()));
    let handle = dispatcher.bind(&candidates).await.expect("a candidate should bind");
    assert_eq!(handle.candidate().name, "second");
    assert_eq!(handle.family(), ProviderFamily::Dashscope);

    let score = handle.score("Paris", "Paris", "grade").await.unwrap();
    assert_eq!(score, JudgeScore::Parsed(64.0));

    broken.assert_async().await;
    healthy.assert_async().await;
}

#[tokio::test]
async fn test_ark_candidate_uses_fixed_endpoint() {
    let mut server = mockito::Server::new_async().await;
    let ark = server
        .mock("POST", "/api/v3/chat/completions")
        .match_header("authorization", "Bearer ark-key")
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({
            "model": "ep-20250101-abc"
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(reply("I'd give it 75 out of 100"))
        .expect(2)
        .create_async()
        .await;

    let mut registry = ProviderRegistry::new();
    registry.register(
        ProviderFamily::Ark,
        Arc::new(
            ChatCompletionsAdapter::new(ProviderFamily::Ark, judge_config())
                .with_ark_endpoint(format!("{}/api/v3/chat/completions", server.url())),
        ),
    );
    let candidate = ModelConfig::from_provider_name(
        "doubao",
        "volcengine",
        ModelSettings::new()
            .with_endpoint("ep-20250101-abc")
            .with_api_key("ark-key"),
    );

    let handle = JudgeDispatcher::new(registry)
        .bind(&[candidate])
        .await
        .expect("ark candidate should bind");
    let score = handle.score("Rome", "Rome", "grade").await.unwrap();
    assert_eq!(score, JudgeScore::Extracted(75.0));
    assert!(score.is_degraded());

    ark.assert_async().await;
}

#[tokio::test]
async fn test_nothing_binds_without_adapters() {
    let candidate = ModelConfig::new(
        "judge",
        ProviderFamily::OpenaiCompatible,
        ModelSettings::new()
            .with_endpoint("http://127.0.0.1:9/v1/chat/completions")
            .with_api_key("sk")
            .with_model_name("judge"),
    );
    let dispatcher = JudgeDispatcher::new(ProviderRegistry::new());
    assert!(dispatcher.bind(&[candidate]).await.is_none());
}
