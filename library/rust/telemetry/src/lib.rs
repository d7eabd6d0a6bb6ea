//! バッチジョブサーバー向けのテレメトリ初期化ライブラリ。
//! tracing-subscriber による構造化ログと、任意の OTLP トレースエクスポートを構成する。

pub mod metrics;

use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use tracing_subscriber::{
    fmt, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// TelemetryConfig は telemetry ライブラリの初期化設定を保持する。
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub version: String,
    pub environment: String,
    pub trace_endpoint: Option<String>,
    pub sample_rate: f64,
    pub log_level: String,
    /// ログ出力フォーマット。"text" の場合はプレーンテキスト、それ以外は JSON。
    pub log_format: String,
}

impl TelemetryConfig {
    /// 開発用の既定値で設定を生成する。
    pub fn for_service(service_name: &str, version: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            version: version.to_string(),
            environment: "dev".to_string(),
            trace_endpoint: None,
            sample_rate: 1.0,
            log_level: "info".to_string(),
            log_format: "json".to_string(),
        }
    }

    /// RUST_LOG が設定されていればそれを優先し、なければ log_level を使う。
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }
}

/// init_telemetry は OpenTelemetry TracerProvider と tracing-subscriber を初期化する。
/// trace_endpoint が指定されている場合のみ OTLP gRPC エクスポータを設定する。
pub fn init_telemetry(cfg: &TelemetryConfig) -> Result<(), Box<dyn std::error::Error>> {
    let tracer = match cfg.trace_endpoint {
        Some(ref endpoint) => {
            let exporter = SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?;
            let provider = sdktrace::TracerProvider::builder()
                .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
                .with_sampler(sdktrace::Sampler::TraceIdRatioBased(cfg.sample_rate))
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", cfg.service_name.clone()),
                    KeyValue::new("service.version", cfg.version.clone()),
                    KeyValue::new("environment", cfg.environment.clone()),
                ]))
                .build();
            let tracer = provider.tracer(cfg.service_name.clone());
            global::set_tracer_provider(provider);
            Some(tracer)
        }
        None => None,
    };

    let registry = tracing_subscriber::registry().with(cfg.env_filter());

    if cfg.log_format == "text" {
        let subscriber = registry.with(
            fmt::layer()
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE),
        );
        match tracer {
            Some(t) => subscriber
                .with(tracing_opentelemetry::layer().with_tracer(t))
                .try_init()?,
            None => subscriber.try_init()?,
        }
    } else {
        let subscriber = registry.with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE),
        );
        match tracer {
            Some(t) => subscriber
                .with(tracing_opentelemetry::layer().with_tracer(t))
                .try_init()?,
            None => subscriber.try_init()?,
        }
    }

    Ok(())
}

/// shutdown は OpenTelemetry TracerProvider をシャットダウンし、未送信のスパンを flush する。
pub fn shutdown() {
    global::shutdown_tracer_provider();
}
