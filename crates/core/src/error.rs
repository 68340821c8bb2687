//! 에러 타입 — 도메인별 에러 정의

/// Vigil 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 수집 계층 에러
    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    /// 탐지 계층 에러
    #[error("detect error: {0}")]
    Detect(#[from] DetectError),

    /// 스토리지 에러
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 환경 변수 값 파싱 실패
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 수집 계층 에러
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// 소켓 바인드 실패
    #[error("failed to bind {kind} socket on {addr}: {reason}")]
    Bind {
        kind: &'static str,
        addr: String,
        reason: String,
    },

    /// 수신 루프 에러
    #[error("{kind} receive error: {reason}")]
    Receive { kind: &'static str, reason: String },
}

/// 탐지 계층 에러
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    /// 파싱 실패
    #[error("parse failed: {reason}")]
    Parse { reason: String },

    /// 규칙 파일 로드 실패
    #[error("failed to load rules from '{path}': {reason}")]
    RuleLoad { path: String, reason: String },

    /// 규칙 유효성 검증 실패
    #[error("invalid rule '{rule_name}': {reason}")]
    RuleValidation { rule_name: String, reason: String },

    /// 모델 추론 실패
    #[error("inference failed: {reason}")]
    Inference { reason: String },
}

/// 스토리지 에러
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// 연결 실패
    #[error("connection failed: {0}")]
    Connection(String),

    /// 쓰기 실패
    #[error("write failed: {0}")]
    Write(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_message() {
        let err = ConfigError::InvalidValue {
            field: "VIGIL_UDP_PORT".to_owned(),
            reason: "not a number".to_owned(),
        };
        assert!(err.to_string().contains("VIGIL_UDP_PORT"));
        assert!(err.to_string().contains("not a number"));
    }

    #[test]
    fn nested_error_conversion() {
        let err: VigilError = DetectError::Parse {
            reason: "empty input".to_owned(),
        }
        .into();
        assert!(err.to_string().contains("detect error"));
        assert!(err.to_string().contains("empty input"));
    }

    #[test]
    fn io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: VigilError = io.into();
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn rule_validation_message_names_rule() {
        let err = DetectError::RuleValidation {
            rule_name: "ssh-block".to_owned(),
            reason: "invalid regex".to_owned(),
        };
        assert!(err.to_string().contains("ssh-block"));
    }
}
