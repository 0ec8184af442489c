use std::time::Duration;

use async_trait::async_trait;
use guard_core::{CaptureError, JobKind, LocationFix, Payload};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::command::run_capture_command;

pub const DEFAULT_LOCATION_ENDPOINT: &str = "http://ip-api.com/json/";
const IP_SOURCE: &str = "IP address (approximate ~1-5km)";
const COMMAND_SOURCE: &str = "location command";

/// Approximate location from the public IP via an ip-api compatible endpoint.
pub struct IpLocator {
    client: Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    status: Option<String>,
    message: Option<String>,
    query: Option<String>,
    country: Option<String>,
    city: Option<String>,
    region_name: Option<String>,
    isp: Option<String>,
    timezone: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
}

impl IpLocator {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self, CaptureError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CaptureError::Failed(format!("http client: {e}")))?;
        Ok(Self { client, endpoint: endpoint.into() })
    }

    pub async fn lookup(&self) -> Result<LocationFix, CaptureError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| CaptureError::Failed(format!("location lookup: {e}")))?;
        let body: IpApiResponse = resp
            .json()
            .await
            .map_err(|e| CaptureError::Failed(format!("location lookup decode: {e}")))?;
        parse_ip_api(body)
    }
}

fn parse_ip_api(body: IpApiResponse) -> Result<LocationFix, CaptureError> {
    if body.status.as_deref() != Some("success") {
        let why = body.message.unwrap_or_else(|| "lookup unsuccessful".to_string());
        return Err(CaptureError::Failed(format!("location lookup: {why}")));
    }
    let (Some(lat), Some(lon)) = (body.lat, body.lon) else {
        return Err(CaptureError::Failed("location lookup returned no coordinates".to_string()));
    };
    Ok(LocationFix {
        lat,
        lon,
        accuracy_m: None,
        source: IP_SOURCE.to_string(),
        ip: body.query,
        city: body.city,
        region: body.region_name,
        country: body.country,
        isp: body.isp,
        timezone: body.timezone,
    })
}

/// Coordinates from a device positioning source (GPS, Wi-Fi), without the
/// network metadata an IP lookup adds.
#[derive(Clone, Debug, PartialEq)]
pub struct PreciseFix {
    pub lat: f64,
    pub lon: f64,
    pub accuracy_m: Option<f64>,
    pub source: String,
}

/// Parse `lat,lon[,accuracy_m[,source]]` from the first non-empty line.
pub fn parse_position(output: &str) -> Result<PreciseFix, CaptureError> {
    let bad = |why: &str| CaptureError::Failed(format!("location command output {why}: {:?}", output.trim()));
    let line = output.lines().map(str::trim).find(|l| !l.is_empty()).ok_or_else(|| bad("is empty"))?;
    let mut fields = line.splitn(4, ',').map(str::trim);
    let mut number = |name: &str| -> Result<Option<f64>, CaptureError> {
        match fields.next().filter(|f| !f.is_empty()) {
            Some(f) => f.parse::<f64>().map(Some).map_err(|_| bad(&format!("has a bad {name}"))),
            None => Ok(None),
        }
    };
    let lat = number("latitude")?.ok_or_else(|| bad("has no latitude"))?;
    let lon = number("longitude")?.ok_or_else(|| bad("has no longitude"))?;
    let accuracy_m = number("accuracy")?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(bad("is out of range"));
    }
    let source = fields
        .next()
        .filter(|s| !s.is_empty())
        .map_or_else(|| COMMAND_SOURCE.to_string(), str::to_string);
    Ok(PreciseFix { lat, lon, accuracy_m, source })
}

/// The precise coordinates win; the IP lookup still supplies ip, place, ISP
/// and timezone. IP coordinates are the last resort.
pub fn merge_fix(
    precise: Option<PreciseFix>,
    ip: Result<LocationFix, CaptureError>,
) -> Result<LocationFix, CaptureError> {
    match (precise, ip) {
        (Some(p), Ok(ip)) => Ok(LocationFix { lat: p.lat, lon: p.lon, accuracy_m: p.accuracy_m, source: p.source, ..ip }),
        (Some(p), Err(e)) => {
            warn!("IP lookup failed, sending the precise fix without place details: {e}");
            Ok(LocationFix {
                lat: p.lat,
                lon: p.lon,
                accuracy_m: p.accuracy_m,
                source: p.source,
                ip: None,
                city: None,
                region: None,
                country: None,
                isp: None,
                timezone: None,
            })
        }
        (None, ip) => ip,
    }
}

/// Location producer: an optional positioning command first, then the IP
/// lookup.
pub struct LocationProducer {
    command: Option<(Vec<String>, Duration)>,
    ip: Option<IpLocator>,
}

impl LocationProducer {
    pub fn new(ip: Option<IpLocator>) -> Self {
        Self { command: None, ip }
    }

    /// `argv` prints `lat,lon[,accuracy_m[,source]]` on stdout.
    pub fn with_command(mut self, argv: Vec<String>, timeout: Duration) -> Self {
        if !argv.is_empty() {
            self.command = Some((argv, timeout));
        }
        self
    }

    async fn precise(&self) -> Option<PreciseFix> {
        let (argv, limit) = self.command.as_ref()?;
        let res = match tokio::time::timeout(*limit, run_capture_command(argv, JobKind::Location)).await {
            Ok(out) => out.and_then(|bytes| parse_position(&String::from_utf8_lossy(&bytes))),
            Err(_) => Err(CaptureError::TimedOut { kind: JobKind::Location, after_ms: limit.as_millis() as u64 }),
        };
        match res {
            Ok(fix) => {
                debug!(source = %fix.source, "precise location fix");
                Some(fix)
            }
            Err(e) => {
                warn!("precise location unavailable, falling back to IP lookup: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl crate::ArtifactProducer for LocationProducer {
    async fn produce(&self, kind: JobKind) -> Result<Payload, CaptureError> {
        if kind != JobKind::Location {
            return Err(CaptureError::Unavailable(kind));
        }
        let precise = self.precise().await;
        let ip = match &self.ip {
            Some(locator) => locator.lookup().await,
            None => Err(CaptureError::Unavailable(JobKind::Location)),
        };
        merge_fix(precise, ip).map(Payload::Location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<LocationFix, CaptureError> {
        parse_ip_api(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn success_response_maps_fields() {
        let fix = parse(
            r#"{"status":"success","country":"Portugal","regionName":"Lisbon","city":"Lisbon",
                "lat":38.72,"lon":-9.14,"timezone":"Europe/Lisbon","isp":"Example ISP","query":"198.51.100.4"}"#,
        )
        .unwrap();
        assert_eq!(fix.lat, 38.72);
        assert_eq!(fix.region.as_deref(), Some("Lisbon"));
        assert_eq!(fix.ip.as_deref(), Some("198.51.100.4"));
        assert_eq!(fix.source, IP_SOURCE);
    }

    #[test]
    fn fail_status_carries_message() {
        let err = parse(r#"{"status":"fail","message":"private range","query":"10.0.0.1"}"#).unwrap_err();
        assert_eq!(err, CaptureError::Failed("location lookup: private range".into()));
    }

    #[test]
    fn missing_coordinates_fail() {
        assert!(parse(r#"{"status":"success","city":"Nowhere"}"#).is_err());
    }

    fn ip_fix() -> LocationFix {
        parse(r#"{"status":"success","country":"Portugal","city":"Lisbon","lat":38.72,"lon":-9.14,"query":"198.51.100.4"}"#)
            .unwrap()
    }

    #[test]
    fn position_line_parses() {
        assert_eq!(
            parse_position("38.7071, -9.1355, 12.5, GPS\n").unwrap(),
            PreciseFix { lat: 38.7071, lon: -9.1355, accuracy_m: Some(12.5), source: "GPS".into() }
        );
        let bare = parse_position("\n  51.5,-0.12\n").unwrap();
        assert_eq!((bare.accuracy_m, bare.source.as_str()), (None, COMMAND_SOURCE));
    }

    #[test]
    fn bad_position_output_fails() {
        assert!(parse_position("").is_err());
        assert!(parse_position("51.5").is_err());
        assert!(parse_position("north,west").is_err());
        assert!(parse_position("95.0,10.0").is_err());
    }

    #[test]
    fn precise_fix_keeps_ip_metadata() {
        let precise = PreciseFix { lat: 38.7071, lon: -9.1355, accuracy_m: Some(12.5), source: "GPS".into() };
        let fix = merge_fix(Some(precise), Ok(ip_fix())).unwrap();
        assert_eq!((fix.lat, fix.lon, fix.accuracy_m), (38.7071, -9.1355, Some(12.5)));
        assert_eq!(fix.source, "GPS");
        assert_eq!(fix.city.as_deref(), Some("Lisbon"));
        assert_eq!(fix.ip.as_deref(), Some("198.51.100.4"));
    }

    #[test]
    fn ip_coordinates_are_the_fallback() {
        let fix = merge_fix(None, Ok(ip_fix())).unwrap();
        assert_eq!((fix.lat, fix.accuracy_m, fix.source.as_str()), (38.72, None, IP_SOURCE));

        let err = CaptureError::Failed("offline".into());
        assert_eq!(merge_fix(None, Err(err.clone())).unwrap_err(), err);
        let alone = merge_fix(Some(PreciseFix { lat: 1.0, lon: 2.0, accuracy_m: None, source: "wifi".into() }), Err(err))
            .unwrap();
        assert_eq!((alone.source.as_str(), alone.city), ("wifi", None));
    }

    #[tokio::test]
    async fn command_fix_without_ip_lookup() {
        use crate::ArtifactProducer;
        let producer = LocationProducer::new(None).with_command(
            vec!["sh".into(), "-c".into(), "echo '48.8566,2.3522,30,wifi'".into()],
            Duration::from_secs(5),
        );
        match producer.produce(JobKind::Location).await.unwrap() {
            Payload::Location(fix) => assert_eq!((fix.accuracy_m, fix.source.as_str()), (Some(30.0), "wifi")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_command_falls_back_to_ip() {
        use crate::ArtifactProducer;
        let producer = LocationProducer::new(None)
            .with_command(vec!["sh".into(), "-c".into(), "exit 1".into()], Duration::from_secs(5));
        assert_eq!(
            producer.produce(JobKind::Location).await.unwrap_err(),
            CaptureError::Unavailable(JobKind::Location)
        );
    }
}
