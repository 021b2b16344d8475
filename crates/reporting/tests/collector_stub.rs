use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    thread,
    time::Duration,
};

use anyhow::Result;
use occupancy::{CountReporter, HourlySummary};
use reporting::{ReportingClient, ReportingConfig};

struct CapturedRequest {
    request_line: String,
    headers: Vec<String>,
    body: String,
}

impl CapturedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.headers
            .iter()
            .find(|line| line.to_ascii_lowercase().starts_with(&prefix))
            .map(|line| line[prefix.len()..].trim())
    }
}

fn read_request(stream: &TcpStream) -> Result<CapturedRequest> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end().to_string();
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = value.trim().parse()?;
        }
        headers.push(line);
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;
    Ok(CapturedRequest {
        request_line: request_line.trim_end().to_string(),
        headers,
        body: String::from_utf8(body)?,
    })
}

/// Serves exactly one request with the given status and body.
fn spawn_collector(status: &'static str, body: &'static str) -> Result<(String, mpsc::Receiver<CapturedRequest>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        if let Ok(request) = read_request(&stream) {
            let _ = tx.send(request);
        }
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = stream.write_all(response.as_bytes());
    });
    Ok((format!("http://{addr}/api/count"), rx))
}

fn summary() -> HourlySummary {
    HourlySummary {
        hourly_count: 12,
        daily_count: 30,
        total_count: 512,
        device_id: "cam-7".into(),
        location: "north-gate".into(),
    }
}

#[test]
fn successful_report_posts_json_with_bearer_token() -> Result<()> {
    let (endpoint, requests) = spawn_collector("200 OK", r#"{"status":"ok"}"#)?;
    let client = ReportingClient::new(ReportingConfig {
        api_key: Some("secret-key".into()),
        ..ReportingConfig::new(endpoint)
    })?;

    let outcome = client.report(&summary());
    assert!(outcome.ok, "{}", outcome.info);
    assert_eq!(outcome.info, r#"{"status":"ok"}"#);

    let request = requests.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(request.request_line, "POST /api/count HTTP/1.1");
    assert_eq!(request.header("authorization"), Some("Bearer secret-key"));
    assert_eq!(request.header("content-type"), Some("application/json"));

    let body: serde_json::Value = serde_json::from_str(&request.body)?;
    assert_eq!(body["hourly_count"], 12);
    assert_eq!(body["daily_count"], 30);
    assert_eq!(body["total_count"], 512);
    assert_eq!(body["device_id"], "cam-7");
    assert_eq!(body["location"], "north-gate");
    assert!(body["timestamp"].is_string());
    Ok(())
}

#[test]
fn missing_api_key_sends_no_authorization() -> Result<()> {
    let (endpoint, requests) = spawn_collector("200 OK", "{}")?;
    let client = ReportingClient::new(ReportingConfig::new(endpoint))?;
    assert!(client.report(&summary()).ok);
    let request = requests.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(request.header("authorization"), None);
    Ok(())
}

#[test]
fn non_200_status_is_a_failure() -> Result<()> {
    let (endpoint, _requests) = spawn_collector("503 Service Unavailable", "overloaded")?;
    let client = ReportingClient::new(ReportingConfig::new(endpoint))?;
    let outcome = client.report(&summary());
    assert!(!outcome.ok);
    assert_eq!(outcome.info, "503: overloaded");
    Ok(())
}

#[test]
fn created_is_not_treated_as_success() -> Result<()> {
    let (endpoint, _requests) = spawn_collector("201 Created", "{}")?;
    let client = ReportingClient::new(ReportingConfig::new(endpoint))?;
    assert!(!client.report(&summary()).ok);
    Ok(())
}

#[test]
fn silent_collector_times_out() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    thread::spawn(move || {
        // Accept and hold the connection without ever answering.
        if let Ok((stream, _)) = listener.accept() {
            thread::sleep(Duration::from_secs(3));
            drop(stream);
        }
    });

    let client = ReportingClient::new(ReportingConfig {
        timeout: Duration::from_millis(200),
        ..ReportingConfig::new(format!("http://{addr}/api/count"))
    })?;
    let outcome = client.report(&summary());
    assert!(!outcome.ok);
    assert_eq!(outcome.info, "timeout");
    Ok(())
}

#[test]
fn refused_connection_is_reported_not_raised() -> Result<()> {
    let addr = TcpListener::bind("127.0.0.1:0")?.local_addr()?;
    let client = ReportingClient::new(ReportingConfig::new(format!("http://{addr}/api/count")))?;
    let outcome = client.report(&summary());
    assert!(!outcome.ok);
    assert_eq!(outcome.info, "connection error");
    Ok(())
}

#[test]
fn reporter_trait_delegates_to_client() -> Result<()> {
    let (endpoint, _requests) = spawn_collector("200 OK", "{}")?;
    let reporter: Box<dyn CountReporter> =
        Box::new(ReportingClient::new(ReportingConfig::new(endpoint))?);
    assert!(reporter.report(&summary()).ok);
    Ok(())
}

#[test]
fn health_check_probes_derived_url() -> Result<()> {
    let (endpoint, requests) = spawn_collector("200 OK", "ok")?;
    let client = ReportingClient::new(ReportingConfig::new(endpoint))?;
    assert!(client.health_check());
    let request = requests.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(request.request_line, "GET /health HTTP/1.1");
    Ok(())
}

#[test]
fn unhealthy_collector_fails_probe() -> Result<()> {
    let (endpoint, _requests) = spawn_collector("500 Internal Server Error", "")?;
    let client = ReportingClient::new(ReportingConfig::new(endpoint))?;
    assert!(!client.health_check());
    Ok(())
}
