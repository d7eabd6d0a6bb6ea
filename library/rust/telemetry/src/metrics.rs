use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Metrics は Prometheus メトリクスのヘルパー構造体である。
/// HTTP の RED メトリクスに加え、バッチジョブの開始・終了・処理件数を記録する。
pub struct Metrics {
    http_requests_total: IntCounterVec,
    http_request_duration: HistogramVec,
    jobs_started_total: IntCounterVec,
    jobs_finished_total: IntCounterVec,
    units_processed_total: IntCounterVec,
    jobs_live: IntGauge,
    registry: Registry,
}

/// デフォルトのヒストグラムバケット。
const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

impl Metrics {
    /// new は Prometheus メトリクスを初期化して返す。
    /// service_name はメトリクスの service ラベルに使用される。
    ///
    /// # Errors
    /// メトリクス定義が不正、または同名メトリクスの二重登録時にエラーを返す。
    pub fn new(service_name: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests")
                .const_label("service", service_name),
            &["method", "path", "status"],
        )?;
        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "Histogram of HTTP request latency",
            )
            .const_label("service", service_name)
            .buckets(DEFAULT_BUCKETS.to_vec()),
            &["method", "path"],
        )?;
        let jobs_started_total = IntCounterVec::new(
            Opts::new(
                "batch_jobs_started_total",
                "Total number of batch job runs started (including resumes)",
            )
            .const_label("service", service_name),
            &["job_kind", "entity_type"],
        )?;
        let jobs_finished_total = IntCounterVec::new(
            Opts::new(
                "batch_jobs_finished_total",
                "Total number of batch job runs that left the execution loop",
            )
            .const_label("service", service_name),
            &["job_kind", "entity_type", "status"],
        )?;
        let units_processed_total = IntCounterVec::new(
            Opts::new(
                "batch_job_units_processed_total",
                "Total number of entities checkpointed by batch jobs",
            )
            .const_label("service", service_name),
            &["job_kind", "entity_type"],
        )?;
        let jobs_live = IntGauge::with_opts(
            Opts::new("batch_jobs_live", "Number of execution loops alive in this process")
                .const_label("service", service_name),
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;
        registry.register(Box::new(jobs_started_total.clone()))?;
        registry.register(Box::new(jobs_finished_total.clone()))?;
        registry.register(Box::new(units_processed_total.clone()))?;
        registry.register(Box::new(jobs_live.clone()))?;

        Ok(Self {
            http_requests_total,
            http_request_duration,
            jobs_started_total,
            jobs_finished_total,
            units_processed_total,
            jobs_live,
            registry,
        })
    }

    /// record_http_request は HTTP リクエストカウンタとレイテンシを記録する。
    pub fn record_http_request(&self, method: &str, path: &str, status: &str, duration_secs: f64) {
        self.http_requests_total
            .with_label_values(&[method, path, status])
            .inc();
        self.http_request_duration
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    /// record_job_started は実行ループの開始を記録する。
    pub fn record_job_started(&self, job_kind: &str, entity_type: &str) {
        self.jobs_started_total
            .with_label_values(&[job_kind, entity_type])
            .inc();
        self.jobs_live.inc();
    }

    /// record_job_finished は実行ループの終了を、最終ステータス付きで記録する。
    pub fn record_job_finished(&self, job_kind: &str, entity_type: &str, status: &str) {
        self.jobs_finished_total
            .with_label_values(&[job_kind, entity_type, status])
            .inc();
        self.jobs_live.dec();
    }

    /// record_units_processed はチェックポイントで確定した処理件数を加算する。
    pub fn record_units_processed(&self, job_kind: &str, entity_type: &str, units: u64) {
        self.units_processed_total
            .with_label_values(&[job_kind, entity_type])
            .inc_by(units);
    }

    /// gather_metrics は Prometheus テキストフォーマットでメトリクスを返す。
    /// /metrics エンドポイントのハンドラで使用する。
    pub fn gather_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
