use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApiError {
    #[snafu(display("backend rejected credentials on `{stage}`"))]
    Unauthorized { stage: &'static str },
    #[snafu(display("credential provider failed on `{stage}`: {message}"))]
    Credentials {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("backend returned status {status} on `{stage}`: {body}"))]
    HttpStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("http request failed on `{stage}`, {source}"))]
    Request {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("failed to decode backend payload on `{stage}`, {source}"))]
    Decode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("backend url '{raw}' is invalid"))]
    InvalidUrl { stage: &'static str, raw: String },
    #[snafu(display("{entity} '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("backend refused `{stage}`: {details}"))]
    Rejected {
        stage: &'static str,
        details: String,
    },
}

pub type ApiResult<T> = Result<T, ApiError>;
