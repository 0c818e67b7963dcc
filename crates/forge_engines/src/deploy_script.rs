#![forbid(unsafe_code)]

use forge_kernel_contracts::deploy::{DeployScriptRequest, DeployTarget};
use forge_kernel_contracts::{ContractViolation, Validate};
use tracing::warn;

pub const DEPLOY_CONTAINER_NAME: &str = "survey_forge_local";
pub const DEPLOY_CONTAINER_PORT: u16 = 5000;
pub const DEPLOY_CONTAINER_DATA_DIR: &str = "/app/data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployScript {
    pub target: DeployTarget,
    pub body: String,
    pub extension: &'static str,
    /// `deploy_<qid>.<sh|ps1>`
    pub filename: String,
}

/// Renders the pull-and-run script for the requested platform. Labels other
/// than `linux`, `mac` and `windows` get the PowerShell script.
pub fn render_deploy_script(
    image_repository: &str,
    request: &DeployScriptRequest,
) -> Result<DeployScript, ContractViolation> {
    request.validate()?;
    let resolution = DeployTarget::resolve(&request.os);
    if resolution.fell_back {
        warn!(os = %request.os, "unrecognized deploy target, rendering windows script");
    }

    let image_full = format!(
        "{}/{}",
        image_repository.trim_end_matches('/'),
        request.image
    );
    let pull_cmd = format!("docker pull {image_full}");
    let run_cmd = format!(
        "docker run -d --restart unless-stopped -v {}:{DEPLOY_CONTAINER_DATA_DIR} -p {}:{DEPLOY_CONTAINER_PORT} --name {DEPLOY_CONTAINER_NAME} {image_full}",
        request.volume_path, request.port
    );
    let port = request.port;

    let body = match resolution.target {
        DeployTarget::Linux => format!(
            "#!/bin/bash\n\
             if ! command -v docker &> /dev/null; then\n\
             \x20   sudo apt update && sudo apt install -y docker.io\n\
             \x20   sudo systemctl start docker\n\
             \x20   sudo systemctl enable docker\n\
             fi\n\
             {pull_cmd}\n\
             {run_cmd}\n\
             echo \"Open: http://localhost:{port}\"\n"
        ),
        DeployTarget::Mac => format!(
            "#!/bin/zsh\n\
             if ! docker info &> /dev/null; then\n\
             \x20   open -a Docker\n\
             \x20   echo \"Starting Docker, waiting 30s\"\n\
             \x20   sleep 30\n\
             fi\n\
             {pull_cmd}\n\
             {run_cmd}\n\
             echo \"Open: http://localhost:{port}\"\n"
        ),
        DeployTarget::Windows => format!(
            "# PowerShell\n\
             if (-not (Get-Command docker -ErrorAction SilentlyContinue)) {{\n\
             \x20   winget install Docker.DockerDesktop\n\
             \x20   Start-Sleep -Seconds 30\n\
             }}\n\
             {pull_cmd}\n\
             {run_cmd}\n\
             Write-Host \"Open: http://localhost:{port}\"\n"
        ),
    };
    let extension = resolution.target.extension();
    Ok(DeployScript {
        target: resolution.target,
        body,
        extension,
        filename: format!("deploy_{}.{extension}", request.qid),
    })
}
