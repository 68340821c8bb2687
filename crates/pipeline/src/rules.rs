//! 시그니처 규칙 엔진 — 결정적 1차 탐지기
//!
//! 이상 탐지 모델을 보완하는 시그니처 매처입니다. 규칙은 YAML 파일에서
//! 로드 순서대로 평가되며, 첫 매칭에서 평가를 중단합니다(첫 매칭이
//! 최종 판정). 정규식 패턴은 로드 시점에 한 번만 컴파일됩니다.
//!
//! # YAML 스키마
//! ```yaml
//! rules:
//!   - name: ssh-block
//!     description: Failed SSH authentication burst
//!     field: service
//!     pattern: sshd
//!     is_regex: false
//!     action: alert
//! ```

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use vigil_core::error::DetectError;
use vigil_core::types::ParsedLog;

/// 규칙 매칭 시 수행할 동작
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// 알림 생성 (기본값)
    #[default]
    Alert,
    /// 수집 드롭 표시
    Drop,
    /// 태그만 부착
    Tag,
}

/// 규칙이 검사하는 레코드 필드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleField {
    /// 소스 호스트 식별자
    Host,
    /// 서비스/프로세스명
    Service,
    /// 메시지 본문
    Message,
}

/// 탐지 규칙 — YAML 파일의 한 항목에 대응합니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// 규칙 이름 (알림 사유에 표시)
    pub name: String,
    /// 규칙 설명
    #[serde(default)]
    pub description: String,
    /// 매칭 시 동작
    #[serde(default)]
    pub action: RuleAction,
    /// 검사 대상 필드
    pub field: RuleField,
    /// 매칭 패턴 (부분 문자열 또는 정규식)
    pub pattern: String,
    /// true면 pattern을 정규식으로 해석
    #[serde(default)]
    pub is_regex: bool,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    rules: Vec<Rule>,
}

struct CompiledRule {
    rule: Rule,
    /// is_regex 규칙에 대해 로드 시 컴파일된 패턴
    regex: Option<Regex>,
}

/// 규칙 엔진
///
/// 로드 순서를 유지하며, `evaluate`는 첫 매칭 규칙의 이름을 반환합니다.
#[derive(Default)]
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
}

impl RuleEngine {
    /// 규칙이 없는 엔진을 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// YAML 파일에서 규칙을 로드합니다.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, DetectError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| DetectError::RuleLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let file: RuleFile = serde_yaml::from_str(&raw).map_err(|e| DetectError::RuleLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let engine = Self::from_rules(file.rules)?;
        tracing::info!(
            path = %path.display(),
            count = engine.len(),
            "loaded detection rules"
        );
        Ok(engine)
    }

    /// 규칙 목록에서 엔진을 생성합니다. 정규식은 이 시점에 컴파일됩니다.
    pub fn from_rules(rules: Vec<Rule>) -> Result<Self, DetectError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.name.is_empty() {
                return Err(DetectError::RuleValidation {
                    rule_name: "(empty)".to_owned(),
                    reason: "rule name must not be empty".to_owned(),
                });
            }
            if rule.pattern.is_empty() {
                return Err(DetectError::RuleValidation {
                    rule_name: rule.name.clone(),
                    reason: "rule pattern must not be empty".to_owned(),
                });
            }

            let regex = if rule.is_regex {
                Some(
                    Regex::new(&rule.pattern).map_err(|e| DetectError::RuleValidation {
                        rule_name: rule.name.clone(),
                        reason: format!("invalid regex: {e}"),
                    })?,
                )
            } else {
                None
            };

            compiled.push(CompiledRule { rule, regex });
        }
        Ok(Self { rules: compiled })
    }

    /// 로그를 모든 규칙에 대해 로드 순서로 평가합니다.
    ///
    /// 첫 매칭 규칙의 이름을 반환하고 평가를 중단합니다.
    pub fn evaluate(&self, log: &ParsedLog) -> Option<&str> {
        for compiled in &self.rules {
            let value = match compiled.rule.field {
                RuleField::Host => &log.host,
                RuleField::Service => &log.service,
                RuleField::Message => &log.message,
            };

            let matched = match &compiled.regex {
                Some(regex) => regex.is_match(value),
                None => value.contains(&compiled.rule.pattern),
            };

            if matched {
                return Some(&compiled.rule.name);
            }
        }
        None
    }

    /// 이름으로 규칙을 조회합니다.
    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|compiled| compiled.rule.name == name)
            .map(|compiled| &compiled.rule)
    }

    /// 로드된 규칙 수를 반환합니다.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// 규칙이 하나도 없는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
