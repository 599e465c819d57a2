use crate::error::{PadError, Result};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// A webhook call as configured on a button.
pub struct Webhook<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub headers: &'a HashMap<String, String>,
    pub params: &'a HashMap<String, String>,
    pub data: Option<&'a serde_json::Value>,
    /// Bounds the whole exchange, connect through response status.
    pub timeout: Duration,
}

/// Execute an HTTP request.
///
/// # Errors
/// `PadError::Http` on transport failure, `PadError::Action` on an
/// unsupported method, a timeout or a non-2xx status.
pub async fn execute(client: &reqwest::Client, hook: &Webhook<'_>) -> Result<()> {
    let method = hook.method.to_uppercase();
    let mut builder = match method.as_str() {
        "GET" => client.get(hook.url),
        "POST" => client.post(hook.url),
        "PUT" => client.put(hook.url),
        "DELETE" => client.delete(hook.url),
        "PATCH" => client.patch(hook.url),
        other => {
            return Err(PadError::Action(format!(
                "unsupported HTTP method: {other}"
            )));
        }
    };

    for (key, value) in hook.headers {
        builder = builder.header(key.as_str(), value.as_str());
    }
    if !hook.params.is_empty() {
        builder = builder.query(hook.params);
    }
    if let Some(data) = hook.data {
        builder = builder.json(data);
    }

    let resp = match tokio::time::timeout(hook.timeout, builder.send()).await {
        Ok(resp) => resp?,
        Err(_) => {
            return Err(PadError::Action(format!(
                "HTTP {method} {} timed out after {:?}",
                hook.url, hook.timeout
            )));
        }
    };
    let status = resp.status();

    if status.is_success() {
        debug!("HTTP {method} {} → {status}", hook.url);
        Ok(())
    } else {
        Err(PadError::Action(format!(
            "HTTP {method} {} returned {status}",
            hook.url
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(5);

    async fn serve(seen: Arc<parking_lot::Mutex<Vec<String>>>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let app = Router::new()
            .route(
                "/hook",
                post(move |Query(q): Query<HashMap<String, String>>, Json(body): Json<serde_json::Value>| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().push(format!("{}:{}", q["room"], body["on"]));
                        StatusCode::NO_CONTENT
                    }
                }),
            )
            .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    #[tokio::test]
    async fn posts_params_and_json() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let base = serve(seen.clone()).await;
        let url = format!("{base}/hook");
        let params = HashMap::from([("room".to_string(), "office".to_string())]);
        let data = serde_json::json!({ "on": true });
        let hook = Webhook {
            method: "post",
            url: &url,
            headers: &HashMap::new(),
            params: &params,
            data: Some(&data),
            timeout: WAIT,
        };
        execute(&reqwest::Client::new(), &hook).await.unwrap();
        assert_eq!(seen.lock().as_slice(), ["office:true"]);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let base = serve(Arc::default()).await;
        let url = format!("{base}/broken");
        let empty = HashMap::new();
        let hook = Webhook {
            method: "GET",
            url: &url,
            headers: &empty,
            params: &empty,
            data: None,
            timeout: WAIT,
        };
        let err = execute(&reqwest::Client::new(), &hook).await.unwrap_err();
        assert!(matches!(err, PadError::Action(ref m) if m.contains("500")));
    }

    #[tokio::test]
    async fn unknown_method_rejected() {
        let empty = HashMap::new();
        let hook = Webhook {
            method: "BREW",
            url: "http://127.0.0.1:9/",
            headers: &empty,
            params: &empty,
            data: None,
            timeout: WAIT,
        };
        assert!(execute(&reqwest::Client::new(), &hook).await.is_err());
    }

    #[tokio::test]
    async fn silent_endpoint_times_out() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let empty = HashMap::new();
        let hook = Webhook {
            method: "GET",
            url: &url,
            headers: &empty,
            params: &empty,
            data: None,
            timeout: Duration::from_millis(200),
        };
        let started = std::time::Instant::now();
        let err = tokio::time::timeout(WAIT, execute(&reqwest::Client::new(), &hook))
            .await
            .expect("webhook must give up on its own")
            .unwrap_err();
        assert!(matches!(err, PadError::Action(ref m) if m.contains("timed out")));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
