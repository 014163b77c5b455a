// Client creation with custom user-agent support for kube 2.x
use crate::error::Result;
use hyper::http::{HeaderName, HeaderValue};
use kube::{Client, Config};

/// Create a new k8s client to interact with k8s cluster api. Every request
/// carries `user_agent`, so cache traffic is easy to tell apart in audit logs.
///
/// # Errors
///
/// Will return `Err` if no cluster config can be inferred or `user_agent` is
/// not a valid header value
pub async fn new(user_agent: &str) -> Result<Client> {
    let mut config = Config::infer().await?;

    let header_value = HeaderValue::from_str(user_agent).map_err(hyper::http::Error::from)?;
    config.headers.push((HeaderName::from_static("user-agent"), header_value));

    Ok(Client::try_from(config)?)
}
