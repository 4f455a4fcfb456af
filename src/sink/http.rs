use crate::config::types::DestinationConfig;
use crate::sink::{LogSink, PutEventsRequest, PutEventsResponse, SinkError, StreamDescription};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const TARGET_PREFIX: &str = "Logs_20140328";
const CONTENT_TYPE_JSON: &str = "application/x-amz-json-1.1";
const DESCRIBE_PAGE_SIZE: u32 = 50;
/// Stop paging if the server keeps handing out tokens
const MAX_DESCRIBE_PAGES: usize = 100;

/// Client for a log-ingestion endpoint speaking the JSON 1.1 protocol
/// (`X-Amz-Target: Logs_20140328.<Operation>`).
#[derive(Debug)]
pub struct HttpSink {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamRequest<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DescribeRequest<'a> {
    log_group_name: &'a str,
    log_stream_name_prefix: &'a str,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DescribeResponse {
    #[serde(default)]
    log_streams: Vec<RemoteStream>,
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteStream {
    log_stream_name: String,
    upload_sequence_token: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(rename = "__type")]
    error_type: Option<String>,
    #[serde(alias = "Message")]
    message: Option<String>,
    expected_sequence_token: Option<String>,
}

impl HttpSink {
    pub fn new(config: &DestinationConfig) -> Result<Self, SinkError> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| SinkError::Transport("no endpoint configured".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SinkError::Transport(format!("invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SinkError::Transport(format!("invalid value for header {}: {}", name.as_str(), e)))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<B: Serialize + ?Sized>(&self, operation: &str, body: &B) -> Result<String, SinkError> {
        let response = self
            .client
            .post(format!("{}/", self.endpoint))
            .header("X-Amz-Target", format!("{}.{}", TARGET_PREFIX, operation))
            .json(body)
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        if (200..300).contains(&status) {
            Ok(text)
        } else {
            tracing::debug!(operation, status, body = %text, "Request failed");
            Err(classify_error(status, &text))
        }
    }

    async fn call_json<B: Serialize + ?Sized, R: DeserializeOwned + Default>(
        &self,
        operation: &str,
        body: &B,
    ) -> Result<R, SinkError> {
        let text = self.call(operation, body).await?;
        if text.trim().is_empty() {
            return Ok(R::default());
        }
        serde_json::from_str(&text).map_err(|e| SinkError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl LogSink for HttpSink {
    async fn describe_stream(
        &self,
        log_group: &str,
        log_stream: &str,
    ) -> Result<Option<StreamDescription>, SinkError> {
        let mut request = DescribeRequest {
            log_group_name: log_group,
            log_stream_name_prefix: log_stream,
            limit: DESCRIBE_PAGE_SIZE,
            next_token: None,
        };

        for _ in 0..MAX_DESCRIBE_PAGES {
            let response: DescribeResponse =
                match self.call_json("DescribeLogStreams", &request).await {
                    Ok(response) => response,
                    // Missing group means missing stream as far as the caller cares
                    Err(SinkError::ResourceNotFound(_)) => return Ok(None),
                    Err(e) => return Err(e),
                };

            if let Some(stream) = response
                .log_streams
                .into_iter()
                .find(|stream| stream.log_stream_name == log_stream)
            {
                return Ok(Some(StreamDescription {
                    upload_sequence_token: stream.upload_sequence_token,
                }));
            }

            match response.next_token {
                Some(token) if request.next_token.as_deref() != Some(token.as_str()) => {
                    request.next_token = Some(token);
                }
                _ => return Ok(None),
            }
        }

        tracing::warn!(log_group, log_stream, pages = MAX_DESCRIBE_PAGES, "Gave up paging through log streams");
        Ok(None)
    }

    async fn create_stream(&self, log_group: &str, log_stream: &str) -> Result<(), SinkError> {
        let request = StreamRequest {
            log_group_name: log_group,
            log_stream_name: log_stream,
        };
        self.call("CreateLogStream", &request).await?;
        tracing::info!(log_group, log_stream, "Created log stream");
        Ok(())
    }

    async fn put_events(&self, request: &PutEventsRequest) -> Result<PutEventsResponse, SinkError> {
        self.call_json("PutLogEvents", request).await
    }
}

/// Map an error response to a [`SinkError`] by its `__type`, then by status
pub fn classify_error(status: u16, body: &str) -> SinkError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed
        .error_type
        .as_deref()
        .map(|t| t.rsplit('#').next().unwrap_or(t).to_string())
        .unwrap_or_default();
    let message = parsed.message.unwrap_or_else(|| body.trim().to_string());

    match code.as_str() {
        "InvalidSequenceTokenException" => SinkError::InvalidSequenceToken {
            expected: parsed.expected_sequence_token,
        },
        "DataAlreadyAcceptedException" => SinkError::DataAlreadyAccepted {
            expected: parsed.expected_sequence_token,
        },
        "ThrottlingException" | "TooManyRequestsException" => SinkError::Throttled(message),
        "ServiceUnavailableException" => SinkError::Transport(message),
        "ResourceNotFoundException" => SinkError::ResourceNotFound(message),
        "ResourceAlreadyExistsException" => SinkError::ResourceAlreadyExists(message),
        _ if status == 429 => SinkError::Throttled(message),
        _ if status >= 500 => SinkError::Transport(format!("status {}: {}", status, message)),
        "" => SinkError::Rejected {
            code: format!("HTTP{}", status),
            message,
        },
        other => SinkError::Rejected {
            code: other.to_string(),
            message,
        },
    }
}
