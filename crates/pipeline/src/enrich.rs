//! GeoIP 보강 서비스
//!
//! 소스 호스트(IP)를 지리 정보로 보강합니다. 데이터베이스는
//! `ip,country_iso,latitude,longitude` 형식의 CSV에서 메모리로 로드되며,
//! 파일이 없으면 보강이 비활성화된 채 파이프라인은 정상 동작합니다.

use std::collections::HashMap;
use std::path::Path;

use vigil_core::types::GeoLocation;

/// 인메모리 GeoIP 조회 서비스
pub struct GeoIpService {
    entries: HashMap<String, GeoLocation>,
}

impl GeoIpService {
    /// CSV 파일에서 데이터베이스를 로드합니다.
    ///
    /// 파일이 없거나 읽기에 실패하면 빈(비활성) 서비스를 반환합니다.
    /// 형식이 잘못된 행은 경고 없이 건너뜁니다 ('#' 주석 행 허용).
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let Ok(raw) = std::fs::read_to_string(path) else {
            tracing::info!(path = %path.display(), "geoip database not found, enrichment disabled");
            return Self {
                entries: HashMap::new(),
            };
        };

        let service = Self::from_csv(&raw);
        tracing::info!(
            path = %path.display(),
            entries = service.entries.len(),
            "geoip database loaded"
        );
        service
    }

    /// CSV 텍스트에서 직접 로드합니다.
    pub fn from_csv(raw: &str) -> Self {
        let mut entries = HashMap::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split(',').map(str::trim);
            let (Some(ip), Some(iso), Some(lat), Some(lon)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let (Ok(latitude), Ok(longitude)) = (lat.parse::<f64>(), lon.parse::<f64>()) else {
                continue;
            };
            entries.insert(
                ip.to_owned(),
                GeoLocation {
                    country_iso: iso.to_owned(),
                    latitude,
                    longitude,
                },
            );
        }
        Self { entries }
    }

    /// 호스트의 지리 정보를 조회합니다.
    pub fn lookup(&self, host: &str) -> Option<&GeoLocation> {
        self.entries.get(host)
    }

    /// 보강이 활성화되어 있는지 확인합니다.
    pub fn is_enabled(&self) -> bool {
        !self.entries.is_empty()
    }

    /// 로드된 엔트리 수를 반환합니다.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# ip, iso, lat, lon
192.168.1.100, KR, 37.5665, 126.9780
10.0.0.1, US, 37.7749, -122.4194
bad row without enough fields
203.0.113.9, DE, not-a-number, 13.40
";

    #[test]
    fn loads_valid_rows_and_skips_malformed() {
        let service = GeoIpService::from_csv(SAMPLE);
        assert_eq!(service.entry_count(), 2);
        assert!(service.is_enabled());
    }

    #[test]
    fn lookup_hits_and_misses() {
        let service = GeoIpService::from_csv(SAMPLE);
        let loc = service.lookup("192.168.1.100").unwrap();
        assert_eq!(loc.country_iso, "KR");
        assert!((loc.latitude - 37.5665).abs() < 1e-9);
        assert!(service.lookup("8.8.8.8").is_none());
    }

    #[test]
    fn missing_file_disables_enrichment() {
        let service = GeoIpService::load("/nonexistent/geoip.csv");
        assert!(!service.is_enabled());
        assert!(service.lookup("10.0.0.1").is_none());
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geoip.csv");
        std::fs::write(&path, "1.2.3.4, FR, 48.85, 2.35\n").unwrap();

        let service = GeoIpService::load(&path);
        assert_eq!(service.entry_count(), 1);
        assert_eq!(service.lookup("1.2.3.4").unwrap().country_iso, "FR");
    }
}
