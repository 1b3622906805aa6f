//! Connection URL construction.

use fleet_link_core::BuildInfo;
use url::Url;

/// Protocol version advertised to the control service.
///
/// Version 2 asks the service to close the connection proactively when
/// heartbeat acknowledgments go missing.
pub const PROTOCOL_VERSION: u32 = 2;

const PATH_SUFFIX: &str = "ws";
const INITIAL_SEQ_NUM: &str = "1";
const SEND_CREDENTIALS_PARAM: &str = "sendCredentials";

/// Inputs for [`session_url`].
#[derive(Debug, Clone, Copy)]
pub struct EndpointParams<'a> {
    /// Discovered base endpoint.
    pub endpoint: &'a str,
    pub cluster: &'a str,
    pub instance_arn: &'a str,
    pub build: &'a BuildInfo,
    /// Workload engine runtime version, when it could be obtained.
    pub engine_version: Option<&'a str>,
    /// Ask the service to resend every credential on connect.
    pub send_credentials: bool,
}

/// Build the connection URL for a discovered endpoint.
///
/// # Errors
/// Returns error if the endpoint is not an absolute URL.
pub fn session_url(params: &EndpointParams<'_>) -> Result<Url, url::ParseError> {
    let mut base = params.endpoint.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    base.push_str(PATH_SUFFIX);

    let mut url = Url::parse(&base)?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("clusterArn", params.cluster)
            .append_pair("containerInstanceArn", params.instance_arn)
            .append_pair("agentHash", &params.build.git_hash)
            .append_pair("agentVersion", &params.build.version)
            .append_pair("seqNum", INITIAL_SEQ_NUM)
            .append_pair("protocolVersion", &PROTOCOL_VERSION.to_string());
        if let Some(version) = params.engine_version {
            query.append_pair("dockerVersion", &format!("DockerVersion: {version}"));
        }
        query.append_pair(
            SEND_CREDENTIALS_PARAM,
            if params.send_credentials { "true" } else { "false" },
        );
    }
    Ok(url)
}
