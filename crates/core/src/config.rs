//! 설정 관리 — 환경 변수 기반 런타임 설정
//!
//! 모든 설정은 기본값을 가지며, `VIGIL_*` 환경 변수로 개별 재정의가 가능합니다.
//! 컨테이너/K8s 배포를 염두에 둔 방식입니다.
//!
//! # 사용 예시
//! ```
//! use vigil_core::config::VigilConfig;
//!
//! let config = VigilConfig::from_env().expect("invalid environment");
//! assert!(config.ingest.ring_buffer_size.is_power_of_two());
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Vigil 통합 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VigilConfig {
    /// 일반 설정
    pub general: GeneralConfig,
    /// 수집 계층 설정
    pub ingest: IngestConfig,
    /// 탐지 계층 설정
    pub detection: DetectionConfig,
    /// 스토리지 설정
    pub storage: StorageConfig,
    /// 능동 방어 설정
    pub defense: DefenseConfig,
    /// 메트릭 설정
    pub metrics: MetricsConfig,
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
}

/// 수집 계층 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// UDP syslog 수신 포트
    pub udp_port: u16,
    /// TCP 수신 포트 (newline framing)
    pub tcp_port: u16,
    /// 링 버퍼 슬롯 수 (2의 거듭제곱)
    pub ring_buffer_size: usize,
    /// 소스별 토큰 보충 속도 (tokens/sec)
    pub rate_limit_per_sec: f64,
    /// 소스별 최대 버스트 허용량
    pub rate_limit_burst: f64,
}

/// 탐지 계층 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// 이상 탐지 모델 파일 경로
    pub model_path: String,
    /// 이상 판정 임계치 (0.0 ~ 1.0)
    pub anomaly_threshold: f32,
    /// 처리 루프의 마이크로배치 크기
    pub batch_size: usize,
    /// 탐지 규칙 YAML 파일 경로
    pub rules_path: String,
    /// GeoIP 데이터베이스 CSV 경로 (없으면 보강 비활성)
    pub geoip_path: String,
}

/// 스토리지 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// ClickHouse HTTP 엔드포인트
    pub clickhouse_url: String,
    /// INSERT 대상 테이블
    pub clickhouse_table: String,
    /// 플러시 배치 크기
    pub flush_batch_size: usize,
    /// 플러시 간격 (밀리초)
    pub flush_interval_ms: u64,
    /// Redis pub/sub 주소 (host:port)
    pub redis_addr: String,
    /// 알림 발행 채널명
    pub alert_channel: String,
}

/// 능동 방어 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefenseConfig {
    /// 방화벽 차단 활성화 여부
    pub active_defense: bool,
    /// 동일 소스 알림 쿨다운 (초)
    pub cooldown_seconds: u64,
    /// 능동 대응 임계 점수
    pub critical_threshold: f32,
    /// 기본 차단 기간 (초)
    pub default_ban_seconds: u64,
}

/// 메트릭 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus 엔드포인트 활성화 여부
    pub enabled: bool,
    /// 수신 주소
    pub listen_addr: String,
    /// 수신 포트
    pub port: u16,
    /// 콘솔 하트비트 간격 (초, 0이면 비활성)
    pub heartbeat_interval_secs: u64,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig {
                log_level: "info".to_owned(),
                log_format: "json".to_owned(),
            },
            ingest: IngestConfig {
                udp_port: 514,
                tcp_port: 601,
                ring_buffer_size: 65536,
                rate_limit_per_sec: 100.0,
                rate_limit_burst: 500.0,
            },
            detection: DetectionConfig {
                model_path: "models/autoencoder.plan".to_owned(),
                anomaly_threshold: 0.8,
                batch_size: 32,
                rules_path: "config/rules.yaml".to_owned(),
                geoip_path: "config/geoip.csv".to_owned(),
            },
            storage: StorageConfig {
                clickhouse_url: "http://localhost:8123".to_owned(),
                clickhouse_table: "vigil.logs".to_owned(),
                flush_batch_size: 1000,
                flush_interval_ms: 1000,
                redis_addr: "localhost:6379".to_owned(),
                alert_channel: "vigil_alerts".to_owned(),
            },
            defense: DefenseConfig {
                active_defense: true,
                cooldown_seconds: 300,
                critical_threshold: 0.95,
                default_ban_seconds: 600,
            },
            metrics: MetricsConfig {
                enabled: true,
                listen_addr: "127.0.0.1".to_owned(),
                port: 9600,
                heartbeat_interval_secs: 10,
            },
        }
    }
}

/// `VIGIL_<NAME>` 환경 변수를 읽어 파싱합니다. 미설정 시 기존 값을 유지합니다.
fn env_override<T: std::str::FromStr>(field: &str, target: &mut T) -> Result<(), ConfigError> {
    let var = format!("VIGIL_{}", field.to_uppercase());
    match std::env::var(&var) {
        Ok(raw) => {
            *target = raw.parse().map_err(|_| ConfigError::InvalidValue {
                field: var,
                reason: format!("failed to parse '{raw}'"),
            })?;
            Ok(())
        }
        Err(_) => Ok(()),
    }
}

impl VigilConfig {
    /// 기본값 위에 환경 변수 재정의를 적용한 설정을 생성합니다.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// 환경 변수 재정의를 현재 설정에 적용합니다.
    pub fn load_from_env(&mut self) -> Result<(), ConfigError> {
        env_override("log_level", &mut self.general.log_level)?;
        env_override("log_format", &mut self.general.log_format)?;

        env_override("udp_port", &mut self.ingest.udp_port)?;
        env_override("tcp_port", &mut self.ingest.tcp_port)?;
        env_override("ring_buffer_size", &mut self.ingest.ring_buffer_size)?;
        env_override("rate_limit_per_sec", &mut self.ingest.rate_limit_per_sec)?;
        env_override("rate_limit_burst", &mut self.ingest.rate_limit_burst)?;

        env_override("model_path", &mut self.detection.model_path)?;
        env_override("anomaly_threshold", &mut self.detection.anomaly_threshold)?;
        env_override("batch_size", &mut self.detection.batch_size)?;
        env_override("rules_path", &mut self.detection.rules_path)?;
        env_override("geoip_path", &mut self.detection.geoip_path)?;

        env_override("clickhouse_url", &mut self.storage.clickhouse_url)?;
        env_override("clickhouse_table", &mut self.storage.clickhouse_table)?;
        env_override("flush_batch_size", &mut self.storage.flush_batch_size)?;
        env_override("flush_interval_ms", &mut self.storage.flush_interval_ms)?;
        env_override("redis_addr", &mut self.storage.redis_addr)?;
        env_override("alert_channel", &mut self.storage.alert_channel)?;

        env_override("active_defense", &mut self.defense.active_defense)?;
        env_override("cooldown_seconds", &mut self.defense.cooldown_seconds)?;
        env_override("critical_threshold", &mut self.defense.critical_threshold)?;
        env_override("default_ban_seconds", &mut self.defense.default_ban_seconds)?;

        env_override("metrics_enabled", &mut self.metrics.enabled)?;
        env_override("metrics_listen_addr", &mut self.metrics.listen_addr)?;
        env_override("metrics_port", &mut self.metrics.port)?;
        env_override(
            "heartbeat_interval_secs",
            &mut self.metrics.heartbeat_interval_secs,
        )?;

        Ok(())
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const MAX_BATCH_SIZE: usize = 65536;

        if !self.ingest.ring_buffer_size.is_power_of_two() || self.ingest.ring_buffer_size < 2 {
            return Err(ConfigError::InvalidValue {
                field: "ring_buffer_size".to_owned(),
                reason: "must be a power of two >= 2".to_owned(),
            });
        }

        if self.detection.batch_size == 0 || self.detection.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "batch_size".to_owned(),
                reason: format!("must be 1-{MAX_BATCH_SIZE}"),
            });
        }

        if !(0.0..=1.0).contains(&self.detection.anomaly_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "anomaly_threshold".to_owned(),
                reason: "must be within 0.0-1.0".to_owned(),
            });
        }

        if !(0.0..=1.0).contains(&self.defense.critical_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "critical_threshold".to_owned(),
                reason: "must be within 0.0-1.0".to_owned(),
            });
        }

        if self.ingest.rate_limit_per_sec <= 0.0 || self.ingest.rate_limit_burst < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "rate_limit".to_owned(),
                reason: "refill rate must be positive and burst >= 1".to_owned(),
            });
        }

        if self.storage.flush_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "flush_batch_size".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }

        if self.storage.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "flush_interval_ms".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }

        if self.defense.cooldown_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cooldown_seconds".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }

        Ok(())
    }
}
