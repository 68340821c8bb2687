//! pub/sub 알림 발행 — 외부 대시보드용 브로드캐스트 채널
//!
//! 치명적 알림을 Redis `PUBLISH` 명령으로 발행합니다. 연결은 단일
//! 뮤텍스로 보호되며, 발행 실패 시 메시지를 버리고 연결을 끊어진 것으로
//! 표시한 뒤 다음 발행에서 지연 재연결합니다.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use vigil_core::types::AlertRecord;

/// 알림 발행 경계
///
/// 알림 매니저가 디스패치에 사용합니다. 발행 성공 여부만 반환하며,
/// 실패한 메시지는 재시도하지 않습니다.
pub trait AlertSink: Send + Sync {
    /// 알림 레코드를 발행합니다. 성공 시 true를 반환합니다.
    fn publish(&self, record: &AlertRecord) -> bool;
}

/// 연결/쓰기/응답 타임아웃
const IO_TIMEOUT: Duration = Duration::from_millis(1500);

/// Redis pub/sub 발행기
///
/// RESP 배열로 `PUBLISH <channel> <json>`을 전송합니다.
pub struct RedisPublisher {
    addr: String,
    channel: String,
    conn: Mutex<Option<TcpStream>>,
}

impl RedisPublisher {
    /// 새 발행기를 생성합니다. 연결은 첫 발행 시점에 수립됩니다.
    pub fn new(addr: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            channel: channel.into(),
            conn: Mutex::new(None),
        }
    }

    /// 현재 연결 상태를 확인합니다.
    pub fn is_connected(&self) -> bool {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn connect(&self) -> Option<TcpStream> {
        let addr = self.addr.to_socket_addrs().ok()?.next()?;
        match TcpStream::connect_timeout(&addr, IO_TIMEOUT) {
            Ok(stream) => {
                let _ = stream.set_write_timeout(Some(IO_TIMEOUT));
                let _ = stream.set_read_timeout(Some(IO_TIMEOUT));
                tracing::info!(addr = %self.addr, "connected to pub/sub endpoint");
                Some(stream)
            }
            Err(e) => {
                tracing::warn!(addr = %self.addr, error = %e, "pub/sub connection failed");
                None
            }
        }
    }

    /// RESP 배열 `PUBLISH <channel> <payload>`를 인코딩합니다.
    fn encode_publish(channel: &str, payload: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(payload.len() + channel.len() + 48);
        buf.extend_from_slice(b"*3\r\n$7\r\nPUBLISH\r\n");
        buf.extend_from_slice(format!("${}\r\n", channel.len()).as_bytes());
        buf.extend_from_slice(channel.as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(format!("${}\r\n", payload.len()).as_bytes());
        buf.extend_from_slice(payload.as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf
    }

    fn publish_raw(&self, payload: &str) -> bool {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        // 지연 재연결
        if guard.is_none() {
            *guard = self.connect();
        }
        let Some(stream) = guard.as_mut() else {
            return false;
        };

        let frame = Self::encode_publish(&self.channel, payload);
        if let Err(e) = stream.write_all(&frame) {
            tracing::warn!(error = %e, "pub/sub publish failed, dropping connection");
            *guard = None;
            return false;
        }

        // 응답(`:N\r\n`)을 소모하여 수신 버퍼 누적을 방지
        let mut reply = [0_u8; 64];
        match stream.read(&mut reply) {
            Ok(0) => {
                tracing::warn!("pub/sub endpoint closed the connection");
                *guard = None;
                false
            }
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "pub/sub reply read failed, dropping connection");
                *guard = None;
                false
            }
        }
    }
}

impl AlertSink for RedisPublisher {
    fn publish(&self, record: &AlertRecord) -> bool {
        let payload = match serde_json::to_string(record) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize alert record");
                return false;
            }
        };
        self.publish_raw(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn sample_record() -> AlertRecord {
        AlertRecord {
            source: "10.0.0.1".to_owned(),
            score: 0.99,
            reason: "Rule: ssh-block".to_owned(),
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn encode_publish_is_valid_resp() {
        let frame = RedisPublisher::encode_publish("alerts", "{}");
        let text = String::from_utf8(frame).unwrap();
        assert_eq!(text, "*3\r\n$7\r\nPUBLISH\r\n$6\r\nalerts\r\n$2\r\n{}\r\n");
    }

    #[test]
    fn publish_without_endpoint_fails_quietly() {
        // 닫힌 포트: 연결 실패 -> false, 패닉 없음
        let publisher = RedisPublisher::new("127.0.0.1:1", "alerts");
        assert!(!publisher.publish(&sample_record()));
        assert!(!publisher.is_connected());
    }

    #[test]
    fn publish_round_trip_against_fake_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = vec![0_u8; 1024];
            let n = socket.read(&mut buf).unwrap();
            socket.write_all(b":1\r\n").unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        let publisher = RedisPublisher::new(addr.to_string(), "vigil_alerts");
        assert!(publisher.publish(&sample_record()));
        assert!(publisher.is_connected());

        let received = server.join().unwrap();
        assert!(received.starts_with("*3\r\n$7\r\nPUBLISH\r\n"));
        assert!(received.contains("vigil_alerts"));
        assert!(received.contains("ssh-block"));
    }

    #[test]
    fn reconnects_after_server_goes_away() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            // 첫 연결은 응답 없이 즉시 종료
            let (socket, _) = listener.accept().unwrap();
            drop(socket);

            // 두 번째 연결은 정상 응답
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = vec![0_u8; 1024];
            let _ = socket.read(&mut buf).unwrap();
            socket.write_all(b":1\r\n").unwrap();
        });

        let publisher = RedisPublisher::new(addr.to_string(), "alerts");
        assert!(!publisher.publish(&sample_record()));
        assert!(!publisher.is_connected());

        // 다음 발행이 지연 재연결을 수행
        assert!(publisher.publish(&sample_record()));
        assert!(publisher.is_connected());
        server.join().unwrap();
    }
}
