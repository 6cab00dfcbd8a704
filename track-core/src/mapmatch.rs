//! Map-matching client.
//!
//! Calls an external HMM-based map matcher over HTTP and snaps a trailing
//! window of points onto the road network. Every failure mode — transport
//! error, timeout, malformed payload, `NoMatch`/`NoSegment`, a null
//! tracepoint — degrades to "echo the input back with confidence 0" rather
//! than propagating an error the caller has to special-case; the processor
//! (§4.5) only needs to branch on the confidence it gets back, except for the
//! genuine transport/parse failures it surfaces as a fallback trigger.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::MapMatchError;
use crate::model::Coords;

/// One point fed into the matcher, positionally paired with its output.
#[derive(Debug, Clone, Copy)]
pub struct MatchInput {
    pub coords: Coords,
    pub timestamp_unix: i64,
    pub accuracy: Option<f64>,
}

/// One matched (or echoed-back) point, positionally paired with its input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchedPoint {
    pub coords: Coords,
    pub confidence: f64,
}

/// The map-matching capability port. A small async trait, not an enum —
/// production wires an HTTP-backed OSRM client, tests and the scenario
/// harness wire a deterministic fake, and the processor depends on neither
/// concretely.
#[async_trait]
pub trait MapMatcher: Send + Sync {
    /// Match `points` (oldest first) against the road network. Returns one
    /// `MatchedPoint` per input, in the same order. Never returns an error
    /// for "no solution" — only for genuine transport/parse failure; "no
    /// solution" is represented as echoed input with confidence 0.
    async fn match_points(&self, points: &[MatchInput]) -> Result<Vec<MatchedPoint>, MapMatchError>;

    /// A lightweight reachability probe. Must return within 5s.
    async fn health(&self) -> bool;
}

fn echo_unmatched(points: &[MatchInput]) -> Vec<MatchedPoint> {
    points
        .iter()
        .map(|p| MatchedPoint {
            coords: p.coords,
            confidence: 0.0,
        })
        .collect()
}

// ── OSRM-compatible HTTP client ───────────────────────────────────────────

/// HTTP client for an OSRM-compatible `/match/v1/driving/{coords}` endpoint.
pub struct OsrmClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl OsrmClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn request_url(&self, points: &[MatchInput]) -> String {
        let coords = points
            .iter()
            .map(|p| format!("{},{}", p.coords.lon, p.coords.lat))
            .collect::<Vec<_>>()
            .join(";");

        let timestamps = points
            .iter()
            .map(|p| p.timestamp_unix.to_string())
            .collect::<Vec<_>>()
            .join(";");

        let last = points.len().saturating_sub(1);
        let radiuses = points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                if i == 0 || i == last {
                    25
                } else {
                    p.accuracy.map(|a| a.round() as i64).unwrap_or(15)
                }
            })
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(";");

        format!(
            "{base}/match/v1/driving/{coords}?timestamps={timestamps}&radiuses={radiuses}&overview=full&steps=true&gaps=ignore&tidy=true",
            base = self.base_url.trim_end_matches('/'),
        )
    }
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    code: String,
    #[serde(default)]
    matchings: Vec<OsrmMatching>,
    #[serde(default)]
    tracepoints: Vec<Option<OsrmTracepoint>>,
}

#[derive(Debug, Deserialize)]
struct OsrmMatching {
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct OsrmTracepoint {
    location: [f64; 2], // [lon, lat]
}

#[async_trait]
impl MapMatcher for OsrmClient {
    async fn match_points(&self, points: &[MatchInput]) -> Result<Vec<MatchedPoint>, MapMatchError> {
        if points.len() < 3 {
            return Ok(echo_unmatched(points));
        }

        let url = self.request_url(points);

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MapMatchError::Timeout(self.timeout)
                } else {
                    MapMatchError::Unreachable(e.to_string())
                }
            })?;

        let body: OsrmResponse = response
            .json()
            .await
            .map_err(|e| MapMatchError::Malformed(e.to_string()))?;

        if body.code != "Ok" {
            // NoMatch, NoSegment, etc. — not a transport failure, just no solution.
            return Ok(echo_unmatched(points));
        }

        let confidence = body.matchings.first().map(|m| m.confidence).unwrap_or(0.0);

        let mut out = Vec::with_capacity(points.len());
        for (input, tracepoint) in points.iter().zip(body.tracepoints.iter()) {
            match tracepoint {
                None => out.push(MatchedPoint {
                    coords: input.coords,
                    confidence: 0.0,
                }),
                Some(tp) => out.push(MatchedPoint {
                    coords: Coords::new(tp.location[1], tp.location[0]),
                    confidence,
                }),
            }
        }

        // Response had fewer tracepoints than requested points: malformed.
        if out.len() != points.len() {
            return Err(MapMatchError::Malformed(format!(
                "expected {} tracepoints, got {}",
                points.len(),
                out.len()
            )));
        }

        Ok(out)
    }

    async fn health(&self) -> bool {
        let probe = [
            MatchInput {
                coords: Coords::new(0.0, 0.0),
                timestamp_unix: 0,
                accuracy: None,
            },
            MatchInput {
                coords: Coords::new(0.001, 0.001),
                timestamp_unix: 1,
                accuracy: None,
            },
        ];
        let url = self.request_url(&probe);
        tokio::time::timeout(Duration::from_secs(5), self.client.get(&url).send())
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(lat: f64, lon: f64, ts: i64) -> MatchInput {
        MatchInput {
            coords: Coords::new(lat, lon),
            timestamp_unix: ts,
            accuracy: None,
        }
    }

    #[test]
    fn request_url_has_bit_exact_query_shape() {
        let client = OsrmClient::new("http://osrm.local", Duration::from_secs(5));
        let points = vec![
            point(10.0, 20.0, 100),
            point(10.1, 20.1, 130),
            point(10.2, 20.2, 160),
        ];
        let url = client.request_url(&points);
        assert!(url.starts_with("http://osrm.local/match/v1/driving/20,10;20.1,10.1;20.2,10.2"));
        assert!(url.contains("timestamps=100;130;160"));
        assert!(url.contains("radiuses=25;15;25"));
        assert!(url.contains("overview=full"));
        assert!(url.contains("steps=true"));
        assert!(url.contains("gaps=ignore"));
        assert!(url.contains("tidy=true"));
    }

    #[test]
    fn interior_radius_uses_accuracy_when_present() {
        let client = OsrmClient::new("http://osrm.local", Duration::from_secs(5));
        let mut points = vec![point(10.0, 20.0, 100), point(10.1, 20.1, 130), point(10.2, 20.2, 160)];
        points[1].accuracy = Some(8.4);
        let url = client.request_url(&points);
        assert!(url.contains("radiuses=25;8;25"));
    }

    #[tokio::test]
    async fn fewer_than_three_points_short_circuits_with_zero_confidence() {
        let client = OsrmClient::new("http://127.0.0.1:1", Duration::from_millis(50));
        let points = vec![point(10.0, 20.0, 100), point(10.1, 20.1, 130)];
        let result = client.match_points(&points).await.unwrap();
        assert_eq!(result.len(), 2);
        assert!(result.iter().all(|p| p.confidence == 0.0));
        assert_eq!(result[0].coords, points[0].coords);
    }
}

// ── Deterministic in-memory fake ──────────────────────────────────────────

/// A scriptable `MapMatcher` for tests and the scenario harness. Either
/// returns a fixed confidence for every tail point, or errors to exercise
/// the `kalman_fallback` path.
pub struct FakeMapMatcher {
    behavior: FakeBehavior,
}

enum FakeBehavior {
    /// Echo every point back with this confidence, nudging coordinates by a
    /// tiny fixed offset so callers can tell matched output from raw input.
    Confidence(f64),
    Errors(fn() -> MapMatchError),
}

impl FakeMapMatcher {
    pub fn confident(confidence: f64) -> Self {
        Self {
            behavior: FakeBehavior::Confidence(confidence),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            behavior: FakeBehavior::Errors(|| MapMatchError::Unreachable("connection refused".into())),
        }
    }

    pub fn malformed() -> Self {
        Self {
            behavior: FakeBehavior::Errors(|| MapMatchError::Malformed("unexpected token".into())),
        }
    }
}

#[async_trait]
impl MapMatcher for FakeMapMatcher {
    async fn match_points(&self, points: &[MatchInput]) -> Result<Vec<MatchedPoint>, MapMatchError> {
        if points.len() < 3 {
            return Ok(echo_unmatched(points));
        }
        match &self.behavior {
            FakeBehavior::Confidence(c) => Ok(points
                .iter()
                .map(|p| MatchedPoint {
                    coords: Coords::new(p.coords.lat + 0.00001, p.coords.lon + 0.00001),
                    confidence: *c,
                })
                .collect()),
            FakeBehavior::Errors(make_err) => Err(make_err()),
        }
    }

    async fn health(&self) -> bool {
        !matches!(self.behavior, FakeBehavior::Errors(_))
    }
}
