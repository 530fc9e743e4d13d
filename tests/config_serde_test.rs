use conformer_blocks::nn::{
    AttentionConfig, LocalWindow, MultiHeadConfig, MultiHeadSelfAttention, ParamGroup,
    ScaledAdamConfig, WindowAxis,
};

#[test]
fn optimizer_config_fills_missing_fields_with_defaults() {
    let cfg: ScaledAdamConfig = serde_json::from_str(r#"{"lr": 0.001, "scaling": false}"#).unwrap();
    assert_eq!(cfg.lr, 0.001);
    assert!(!cfg.scaling);
    assert_eq!(cfg.beta2, ScaledAdamConfig::default().beta2);
    assert!(cfg.bias_correction);
}

#[test]
fn param_group_overrides_are_optional() {
    let group: ParamGroup = serde_json::from_str(r#"{"lr": 0.5, "frozen": true}"#).unwrap();
    assert_eq!(group.lr, Some(0.5));
    assert_eq!(group.beta1, None);
    assert!(group.frozen);
}

#[test]
fn multi_head_config_from_json() {
    let json = r#"{
        "dim": 12,
        "heads": 3,
        "dim_head": 4,
        "attention": { "local_window": { "width": 5, "axis": "key" }, "linear_bias": 64 }
    }"#;
    let cfg: MultiHeadConfig = serde_json::from_str(json).unwrap();
    assert_eq!(cfg.inner_dim(), 12);
    assert_eq!(cfg.dropout, 0.0);
    let window = cfg.attention.local_window.unwrap();
    assert_eq!(window.axis, WindowAxis::Key);
    assert_eq!(window.decay, 0.3);
    assert_eq!(cfg.attention.linear_bias, Some(64));
    assert!(MultiHeadSelfAttention::new(cfg).is_ok());
}

#[test]
fn multi_head_config_survives_a_json_round_trip() {
    let cfg = MultiHeadConfig::new(32)
        .with_heads(4, 16)
        .with_dropout(0.1)
        .with_attention(
            AttentionConfig::default()
                .with_local_window(LocalWindow::new(7, WindowAxis::Query))
                .with_linear_bias(128),
        );
    let text = serde_json::to_string(&cfg).unwrap();
    assert!(text.contains("\"query\""));
    let back: MultiHeadConfig = serde_json::from_str(&text).unwrap();
    assert_eq!(back, cfg);
}

#[test]
fn empty_json_gives_documented_defaults() {
    let cfg: MultiHeadConfig = serde_json::from_str("{}").unwrap();
    assert_eq!((cfg.heads, cfg.dim_head), (8, 64));
    assert_eq!(cfg.attention, AttentionConfig::default());
}
