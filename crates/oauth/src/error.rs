/// The token endpoint answered an `authorization_code` exchange with a non-2xx status.
#[derive(Debug, thiserror::Error)]
pub enum TokenRequestError {
    #[error("token endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}
