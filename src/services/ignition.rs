// Discovery-image ignition rendering: a pure render(context) -> text
// producing the Ignition v2.2.0 document that enrolls the host agent.

use crate::error::{ApiError, ApiResult};
use crate::models::Cluster;
use crate::services::validation;

const AGENT_MESSAGE_OF_THE_DAY: &str = r#"
**  **  **  **  **  **  **  **  **  **  **  **  **  **  **  **  **  ** **  **  **  **  **  **  **
This is a host being installed by the MetalForge installer.
It will be installed from scratch during the installation.
The primary service is agent.service.  To watch its status run e.g
sudo journalctl -u agent.service
**  **  **  **  **  **  **  **  **  **  **  **  **  **  **  **  **  ** **  **  **  **  **  **  **
"#;

const IGNITION_CONFIG_FORMAT: &str = r#"{
"ignition": { "version": "2.2.0" },
  "passwd": {
    "users": [
      {{.userSshKey}}
    ]
  },
"systemd": {
"units": [{
"name": "agent.service",
"enabled": true,
"contents": "[Service]\nType=simple\nRestart=always\nRestartSec=3\nStartLimitIntervalSec=0\nEnvironment=HTTP_PROXY={{.HTTPProxy}}\nEnvironment=http_proxy={{.HTTPProxy}}\nEnvironment=HTTPS_PROXY={{.HTTPSProxy}}\nEnvironment=https_proxy={{.HTTPSProxy}}\nEnvironment=NO_PROXY={{.NoProxy}}\nEnvironment=no_proxy={{.NoProxy}}\nEnvironment=PULL_SECRET_TOKEN={{.PullSecretToken}}\nExecStartPre=podman run --privileged --rm -v /usr/local/bin:/hostbin {{.AgentDockerImg}} cp /usr/bin/agent /hostbin\nExecStart=/usr/local/bin/agent --url {{.ServiceBaseURL}} --cluster-id {{.clusterId}} --agent-version {{.AgentDockerImg}}\n\n[Install]\nWantedBy=multi-user.target"
}]
},
"storage": {
    "files": [{
      "filesystem": "root",
      "path": "/etc/motd",
      "mode": 644,
      "contents": { "source": "data:,{{.AGENT_MOTD}}" }
    }]
  }
}"#;

/// Path-style percent encoding for the MOTD data URL.
fn percent_encode_path(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'$' | b'&'
            | b'+' | b',' | b':' | b'=' | b'@' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn user_ssh_key_fragment(ssh_key: &str) -> String {
    if ssh_key.is_empty() {
        return String::new();
    }
    format!(
        r#"{{
		"name": "core",
		"passwordHash": "$6$MWO4bibU8TIWG0XV$Hiuj40lWW7pHiwJmXA8MehuBhdxSswLgvGxEh8ByEzeX2D1dk87JILVUYS4JQOP45bxHRegAB9Fs/SWfszXa5.",
		"sshAuthorizedKeys": [
		"{}"],
		"groups": [ "sudo" ]}}"#,
        ssh_key
    )
}

/// Render the discovery ignition for a cluster. Fails when the pull
/// secret has no token for the cloud registry.
pub fn format_ignition_file(
    cluster: &Cluster,
    ssh_public_key: &str,
    agent_docker_image: &str,
    service_base_url: &str,
) -> ApiResult<String> {
    let auths = validation::parse_pull_secret(&cluster.pull_secret)?;
    let registry_auth = auths.get("cloud.openshift.com").ok_or_else(|| {
        ApiError::BadInput("Pull secret does not contain auth for cloud.openshift.com".to_string())
    })?;

    let replacements = [
        ("{{.userSshKey}}", user_ssh_key_fragment(ssh_public_key)),
        ("{{.AgentDockerImg}}", agent_docker_image.to_string()),
        ("{{.ServiceBaseURL}}", service_base_url.trim().to_string()),
        ("{{.clusterId}}", cluster.id.to_string()),
        ("{{.PullSecretToken}}", registry_auth.auth.clone()),
        (
            "{{.AGENT_MOTD}}",
            percent_encode_path(AGENT_MESSAGE_OF_THE_DAY),
        ),
        ("{{.HTTPProxy}}", cluster.http_proxy.clone()),
        ("{{.HTTPSProxy}}", cluster.https_proxy.clone()),
        ("{{.NoProxy}}", cluster.no_proxy.clone()),
    ];
    let mut rendered = IGNITION_CONFIG_FORMAT.to_string();
    for (placeholder, value) in replacements {
        rendered = rendered.replace(placeholder, &value);
    }
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateClusterRequest;
    use uuid::Uuid;

    fn cluster_with_pull_secret() -> Cluster {
        let params = CreateClusterRequest {
            name: "demo".to_string(),
            base_dns_domain: None,
            openshift_version: None,
            cluster_network_cidr: None,
            cluster_network_host_prefix: None,
            service_network_cidr: None,
            api_vip: None,
            ingress_vip: None,
            ssh_public_key: None,
            pull_secret: None,
            http_proxy: Some("http://proxy:3128".to_string()),
            https_proxy: None,
            no_proxy: None,
        };
        let mut cluster = Cluster::new(Uuid::new_v4(), params, String::new(), String::new());
        cluster.set_pull_secret(
            r#"{"auths":{"cloud.openshift.com":{"auth":"dXNlcjp0b2tlbg=="}}}"#.to_string(),
        );
        cluster
    }

    #[test]
    fn render_substitutes_every_variable() {
        let cluster = cluster_with_pull_secret();
        let rendered = format_ignition_file(
            &cluster,
            "ssh-rsa AAAA test@host",
            "quay.io/metalforge/agent:latest",
            "http://service.local:8090",
        )
        .unwrap();
        assert!(rendered.contains(r#""version": "2.2.0""#));
        assert!(rendered.contains("agent.service"));
        assert!(rendered.contains(&cluster.id.to_string()));
        assert!(rendered.contains("dXNlcjp0b2tlbg=="));
        assert!(rendered.contains("ssh-rsa AAAA test@host"));
        assert!(rendered.contains("http://proxy:3128"));
        assert!(!rendered.contains("{{."));
        // the rendered document is itself valid json
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["ignition"]["version"], "2.2.0");
    }

    #[test]
    fn render_without_cloud_registry_auth_fails() {
        let mut cluster = cluster_with_pull_secret();
        cluster.set_pull_secret(
            r#"{"auths":{"quay.io":{"auth":"dXNlcjp0b2tlbg=="}}}"#.to_string(),
        );
        assert!(format_ignition_file(&cluster, "", "img", "url").is_err());
    }

    #[test]
    fn empty_ssh_key_renders_no_user() {
        let cluster = cluster_with_pull_secret();
        let rendered = format_ignition_file(&cluster, "", "img", "url").unwrap();
        assert!(!rendered.contains("sshAuthorizedKeys"));
    }

    #[test]
    fn motd_is_percent_encoded() {
        let encoded = percent_encode_path("a b\nc");
        assert_eq!(encoded, "a%20b%0Ac");
    }
}
