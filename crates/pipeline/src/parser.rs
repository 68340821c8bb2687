//! 로그 파서 — 원시 이벤트를 구조화 레코드와 피처 임베딩으로 변환
//!
//! syslog 스타일 라인에서 severity/서비스/메시지를 best-effort로 추출합니다.
//! PRI 필드(`<NNN>`)가 없는 평문 라인도 전체를 메시지로 취급하여 수용합니다.
//! 호스트 식별자는 수신 주소에서 가져옵니다 (업스트림이 IP 기준으로
//! 차단/보강을 수행하기 때문).
//!
//! 피처 임베딩은 바이트 분포 기반의 결정적 128차원 벡터로, 이상 탐지
//! 모델의 입력이 됩니다.

use vigil_core::error::DetectError;
use vigil_core::types::{ParsedLog, Severity, FEATURE_DIM};

use crate::ring::RawLogEvent;

/// RFC 5424에서 유효한 최대 PRI 값 (facility 23 * 8 + severity 7)
const MAX_SYSLOG_PRI: u8 = 191;

/// 히스토그램에 직접 매핑되는 출력 가능 ASCII 구간
const HISTOGRAM_DIMS: usize = 96;

/// 원시 이벤트를 파싱합니다.
///
/// 빈 페이로드만 실패로 처리하며, 그 외 형식 위반은 best-effort로
/// 필드를 채웁니다.
pub fn parse_event(event: &RawLogEvent) -> Result<ParsedLog, DetectError> {
    let text = String::from_utf8_lossy(event.payload());
    let line = text.trim();

    if line.is_empty() {
        return Err(DetectError::Parse {
            reason: "empty payload".to_owned(),
        });
    }

    let (severity, rest) = split_priority(line);
    let (service, message) = split_service(rest);

    let mut log = ParsedLog::new(
        event.timestamp_ns,
        host_from_source(event.source()).to_owned(),
        service,
        message,
    );
    log.severity = severity;
    log.features = embed(event.payload());

    Ok(log)
}

/// 수신 주소에서 호스트 식별자(IP)를 추출합니다.
///
/// "ip:port" 형태면 포트를 제거하고, IPv6 브래킷 표기도 처리합니다.
fn host_from_source(source: &str) -> &str {
    if let Some(stripped) = source.strip_prefix('[') {
        // "[::1]:514" -> "::1"
        if let Some(end) = stripped.find(']') {
            return &stripped[..end];
        }
    }
    match source.rsplit_once(':') {
        // 콜론이 여러 개면 브래킷 없는 IPv6 주소로 간주하고 그대로 사용
        Some((host, port)) if port.parse::<u16>().is_ok() && !host.contains(':') => host,
        _ => source,
    }
}

/// 선두의 syslog PRI 필드를 디코딩합니다.
///
/// PRI가 없거나 잘못된 형식이면 Info 심각도로 전체 라인을 반환합니다.
fn split_priority(line: &str) -> (Severity, &str) {
    let Some(stripped) = line.strip_prefix('<') else {
        return (Severity::Info, line);
    };
    let Some(end) = stripped.find('>') else {
        return (Severity::Info, line);
    };
    let Ok(pri) = stripped[..end].parse::<u8>() else {
        return (Severity::Info, line);
    };
    if pri > MAX_SYSLOG_PRI {
        return (Severity::Info, line);
    }

    // PRI = facility * 8 + severity
    let severity = match pri % 8 {
        0..=2 => Severity::Critical,
        3 => Severity::High,
        4 => Severity::Medium,
        5 => Severity::Low,
        _ => Severity::Info,
    };
    (severity, stripped[end + 1..].trim_start())
}

/// "service[pid]: message" / "service: message" 접두를 분리합니다.
///
/// RFC 3164 스타일 헤더("Jan 15 12:00:00 host sshd[42]: ...")의 경우
/// 콜론 앞의 마지막 토큰을 태그로 취합니다. 태그를 찾지 못하면 서비스는
/// "unknown"이 되고 전체가 메시지입니다.
fn split_service(rest: &str) -> (String, String) {
    if let Some((prefix, message)) = rest.split_once(": ") {
        let tag = prefix.rsplit(' ').next().unwrap_or("");
        let service = match tag.split_once('[') {
            Some((name, _pid)) => name,
            None => tag,
        };
        let well_formed = !service.is_empty()
            && service
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
        if well_formed {
            return (service.to_owned(), message.to_owned());
        }
    }
    ("unknown".to_owned(), rest.to_owned())
}

/// 결정적 바이트 분포 임베딩을 계산합니다.
///
/// - `[0, 96)`: 출력 가능 ASCII(0x20~0x7F) 히스토그램, 길이로 정규화
/// - `[96]`: 길이 / PAYLOAD_MAX
/// - `[97]`: 숫자 비율, `[98]`: 알파벳 비율, `[99]`: 공백 비율
/// - 나머지 차원은 0
fn embed(payload: &[u8]) -> [f32; FEATURE_DIM] {
    let mut features = [0.0_f32; FEATURE_DIM];
    if payload.is_empty() {
        return features;
    }

    #[allow(clippy::cast_precision_loss)]
    let len = payload.len() as f32;
    let mut digits = 0_u32;
    let mut alphas = 0_u32;
    let mut spaces = 0_u32;

    for &byte in payload {
        if (0x20..0x80).contains(&byte) {
            features[(byte - 0x20) as usize] += 1.0;
        }
        if byte.is_ascii_digit() {
            digits += 1;
        } else if byte.is_ascii_alphabetic() {
            alphas += 1;
        } else if byte == b' ' {
            spaces += 1;
        }
    }

    for value in features.iter_mut().take(HISTOGRAM_DIMS) {
        *value /= len;
    }

    #[allow(clippy::cast_precision_loss)]
    {
        features[HISTOGRAM_DIMS] = len / crate::ring::PAYLOAD_MAX as f32;
        features[HISTOGRAM_DIMS + 1] = digits as f32 / len;
        features[HISTOGRAM_DIMS + 2] = alphas as f32 / len;
        features[HISTOGRAM_DIMS + 3] = spaces as f32 / len;
    }

    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ring_buffer;

    fn make_event(payload: &[u8], source: &str) -> RawLogEvent {
        let (mut tx, mut rx) = ring_buffer(2);
        assert!(tx.push(payload, source));
        let mut out = RawLogEvent::default();
        assert!(rx.pop(&mut out));
        out
    }

    #[test]
    fn parses_syslog_line_with_pri_and_tag() {
        let event = make_event(
            b"<34>Jan 15 12:00:00 web-01 sshd[4321]: Failed password for root",
            "192.168.1.100:40512",
        );
        let log = parse_event(&event).unwrap();
        assert_eq!(log.host, "192.168.1.100");
        assert_eq!(log.service, "sshd");
        assert_eq!(log.severity, Severity::Critical); // PRI 34 % 8 == 2
        assert_eq!(log.message, "Failed password for root");
        assert!(log.timestamp_ns > 0);
    }

    #[test]
    fn tag_without_pid_brackets() {
        let event = make_event(b"nginx: GET /index.html 200", "10.0.0.5:1234");
        let log = parse_event(&event).unwrap();
        assert_eq!(log.service, "nginx");
        assert_eq!(log.message, "GET /index.html 200");
    }

    #[test]
    fn plain_line_falls_back_to_unknown_service() {
        let event = make_event(b"something happened on the host", "10.0.0.5:1234");
        let log = parse_event(&event).unwrap();
        assert_eq!(log.service, "unknown");
        assert_eq!(log.severity, Severity::Info);
        assert_eq!(log.message, "something happened on the host");
    }

    #[test]
    fn empty_payload_is_a_parse_error() {
        let event = make_event(b"   ", "10.0.0.5:1234");
        assert!(parse_event(&event).is_err());
    }

    #[test]
    fn severity_mapping_from_pri() {
        for (pri, expected) in [
            (0_u8, Severity::Critical),
            (11, Severity::High),     // 11 % 8 == 3
            (12, Severity::Medium),   // 4
            (13, Severity::Low),      // 5
            (14, Severity::Info),     // 6
            (15, Severity::Info),     // 7
        ] {
            let line = format!("<{pri}>app: msg");
            let event = make_event(line.as_bytes(), "h:1");
            let log = parse_event(&event).unwrap();
            assert_eq!(log.severity, expected, "pri {pri}");
        }
    }

    #[test]
    fn invalid_pri_is_treated_as_plain_text() {
        let event = make_event(b"<999>not really syslog", "h:1");
        let log = parse_event(&event).unwrap();
        assert_eq!(log.severity, Severity::Info);
        assert!(log.message.contains("<999>"));
    }

    #[test]
    fn host_strips_port_and_handles_ipv6() {
        assert_eq!(host_from_source("192.168.1.1:514"), "192.168.1.1");
        assert_eq!(host_from_source("[::1]:514"), "::1");
        assert_eq!(host_from_source("fe80::1"), "fe80::1");
        assert_eq!(host_from_source("10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn embedding_is_deterministic_and_normalized() {
        let event = make_event(b"sshd: Failed password for root 42", "h:1");
        let a = parse_event(&event).unwrap();
        let b = parse_event(&event).unwrap();
        assert_eq!(a.features, b.features);

        // 히스토그램 구간 합은 출력 가능 바이트 비율이므로 1.0 이하
        let hist_sum: f32 = a.features[..HISTOGRAM_DIMS].iter().sum();
        assert!(hist_sum > 0.0 && hist_sum <= 1.0 + f32::EPSILON);
    }

    #[test]
    fn embedding_ratio_features_are_populated() {
        let event = make_event(b"abc 123", "h:1");
        let log = parse_event(&event).unwrap();
        // 숫자 3/7, 알파벳 3/7, 공백 1/7
        assert!((log.features[HISTOGRAM_DIMS + 1] - 3.0 / 7.0).abs() < 1e-6);
        assert!((log.features[HISTOGRAM_DIMS + 2] - 3.0 / 7.0).abs() < 1e-6);
        assert!((log.features[HISTOGRAM_DIMS + 3] - 1.0 / 7.0).abs() < 1e-6);
    }

    #[test]
    fn binary_payload_parses_lossily() {
        let event = make_event(&[0xFF, 0xFE, b'h', b'i'], "h:1");
        let log = parse_event(&event).unwrap();
        assert!(log.message.contains("hi"));
    }
}
