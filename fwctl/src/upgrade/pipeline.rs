//! Remote command pipelines
//!
//! [`build`] renders a job into the ordered command steps its phases run. Rendering is pure:
//! it reads the job and the configured parameters and never touches the device or the local
//! filesystem. Remote scripts are a single `&&` chain so the remote shell stops at the first
//! failing fragment, and every path that reaches the shell goes through [`shell_quote`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::UpgradeError;
use crate::models::job::{JobKind, UpgradeJob};
use crate::upgrade::fsm::JobPhase;

/// Phase a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PreCheck,
    Execute,
    Verify,
}

impl Stage {
    /// Stage run while the job is in `phase`
    pub fn for_phase(phase: JobPhase) -> Option<Stage> {
        match phase {
            JobPhase::PreChecking => Some(Stage::PreCheck),
            JobPhase::Executing => Some(Stage::Execute),
            JobPhase::Verifying => Some(Stage::Verify),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Shell fragments joined into one `&&` chain and run over ssh
    RemoteShell { fragments: Vec<String> },
    /// Copy a local file to the device
    Upload { local: PathBuf, remote: String },
}

impl StepAction {
    /// The remote script, for shell actions
    pub fn script(&self) -> Option<String> {
        match self {
            StepAction::RemoteShell { fragments } => Some(fragments.join(" && ")),
            StepAction::Upload { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStep {
    pub stage: Stage,
    pub action: StepAction,
}

/// Software upgrade parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftwareParams {
    #[serde(default = "default_software_archive")]
    pub archive: String,

    /// Where the application archive is unpacked
    #[serde(default = "default_software_extract_path")]
    pub extract_path: String,
}

fn default_software_archive() -> String {
    "qt_update.tar.gz".to_string()
}

fn default_software_extract_path() -> String {
    "/mnt/qtfs".to_string()
}

impl Default for SoftwareParams {
    fn default() -> Self {
        Self {
            archive: default_software_archive(),
            extract_path: default_software_extract_path(),
        }
    }
}

/// Firmware upgrade parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareParams {
    #[serde(default = "default_firmware_archive")]
    pub archive: String,

    /// Boot partition block device
    #[serde(default = "default_firmware_device")]
    pub device: String,

    #[serde(default = "default_firmware_mount_point")]
    pub mount_point: String,
}

fn default_firmware_archive() -> String {
    "boots.tar.gz".to_string()
}

fn default_firmware_device() -> String {
    "/dev/mmcblk0p1".to_string()
}

fn default_firmware_mount_point() -> String {
    "/mnt/mmcblk0p1".to_string()
}

impl Default for FirmwareParams {
    fn default() -> Self {
        Self {
            archive: default_firmware_archive(),
            device: default_firmware_device(),
            mount_point: default_firmware_mount_point(),
        }
    }
}

/// Module upgrade parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleParams {
    #[serde(default = "default_module_archive")]
    pub archive: String,

    /// Staging directory, relative to the package directory
    #[serde(default = "default_module_staging_dir")]
    pub staging_dir: String,

    #[serde(default = "default_module_tool")]
    pub tool: String,

    #[serde(default = "default_module_payload")]
    pub payload: String,
}

fn default_module_archive() -> String {
    "ku5p_package.tar.gz".to_string()
}

fn default_module_staging_dir() -> String {
    "updatepackage".to_string()
}

fn default_module_tool() -> String {
    "ku5pupgrade".to_string()
}

fn default_module_payload() -> String {
    "ku5p_package.bit".to_string()
}

impl Default for ModuleParams {
    fn default() -> Self {
        Self {
            archive: default_module_archive(),
            staging_dir: default_module_staging_dir(),
            tool: default_module_tool(),
            payload: default_module_payload(),
        }
    }
}

/// Everything the builder needs besides the job itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineParams {
    #[serde(default)]
    pub software: SoftwareParams,

    #[serde(default)]
    pub firmware: FirmwareParams,

    #[serde(default)]
    pub module: ModuleParams,
}

/// Quote `value` for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Join a directory and a name with exactly one separator
pub fn remote_join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Numbered shell steps rendered as one conjunction
struct Script {
    steps: Vec<(String, Vec<String>)>,
}

impl Script {
    fn new() -> Self {
        Self { steps: Vec::new() }
    }

    fn step(mut self, label: &str, fragments: Vec<String>) -> Self {
        self.steps.push((label.to_string(), fragments));
        self
    }

    fn render(self, stage: Stage) -> CommandStep {
        let total = self.steps.len();
        let mut fragments = Vec::new();
        for (index, (label, commands)) in self.steps.into_iter().enumerate() {
            let marker = format!("Step {}/{}: {}", index + 1, total, label);
            fragments.push(format!("echo {}", shell_quote(&marker)));
            fragments.extend(commands);
        }
        CommandStep {
            stage,
            action: StepAction::RemoteShell { fragments },
        }
    }
}

/// `if [ ! -f path ]; then echo message; exit 1; fi`
fn require_file(path: &str, message: &str) -> String {
    format!(
        "if [ ! -f {} ]; then echo {}; exit 1; fi",
        shell_quote(path),
        shell_quote(message)
    )
}

/// Render the command steps of `job`, in execution order
pub fn build(job: &UpgradeJob, params: &PipelineParams) -> Result<Vec<CommandStep>, UpgradeError> {
    let steps = match job.kind {
        JobKind::SoftwareUpgrade => software_steps(&job.remote_path, &params.software),
        JobKind::FirmwareUpgrade => firmware_steps(&job.remote_path, &params.firmware),
        JobKind::ModuleUpgrade => module_steps(&job.remote_path, &params.module),
        JobKind::FileTransfer => {
            let local = job.source_path.clone().ok_or_else(|| {
                UpgradeError::ValidationError("File transfer without a local file".to_string())
            })?;
            transfer_steps(local, &job.remote_path)
        }
    };
    Ok(steps)
}

fn software_steps(dir: &str, params: &SoftwareParams) -> Vec<CommandStep> {
    let archive = remote_join(dir, &params.archive);
    let script = Script::new()
        .step(
            "Checking package",
            vec![require_file(
                &archive,
                &format!("ERROR: {} not found in {}", params.archive, dir),
            )],
        )
        .step(
            "Extracting application",
            vec![format!(
                "tar -xzvf {} -C {}",
                shell_quote(&archive),
                shell_quote(&params.extract_path)
            )],
        )
        .step("Flushing to storage", vec!["sync".to_string()]);
    vec![script.render(Stage::Execute)]
}

fn firmware_steps(dir: &str, params: &FirmwareParams) -> Vec<CommandStep> {
    let archive = remote_join(dir, &params.archive);
    let device = shell_quote(&params.device);
    let mount_point = shell_quote(&params.mount_point);

    let precheck = Script::new()
        .step(
            "Checking boot device",
            vec![format!(
                "if [ ! -b {device} ]; then echo {}; exit 1; fi",
                shell_quote(&format!("ERROR: device {} not found", params.device))
            )],
        )
        .step("Listing package directory", vec![format!("ls -la {}", shell_quote(dir))])
        .step(
            "Checking firmware archive",
            vec![format!(
                "if [ -f {archive} ]; then tar -tzf {archive} > /dev/null; else echo 'ERROR: Firmware file not found'; exit 1; fi",
                archive = shell_quote(&archive)
            )],
        )
        .step("Checking free space", vec!["df -h".to_string()]);

    let execute = Script::new()
        .step("Preparing mount point", vec![format!("mkdir -p {mount_point}")])
        .step(
            "Releasing previous mounts",
            vec![
                format!("if mountpoint -q {mount_point}; then umount {mount_point}; fi"),
                format!(
                    "if mount | grep -q {}; then umount {device}; fi",
                    shell_quote(&format!("^{} ", params.device))
                ),
            ],
        )
        .step(
            "Mounting boot partition",
            vec![
                format!("mount {device} {mount_point}"),
                format!("df -h {mount_point}"),
            ],
        )
        .step(
            "Checking firmware archive",
            vec![format!(
                "if [ ! -f {} ]; then echo {}; umount {mount_point}; exit 1; fi",
                shell_quote(&archive),
                shell_quote(&format!("ERROR: {} not found in {}", params.archive, dir))
            )],
        )
        .step(
            "Extracting firmware",
            vec![format!(
                "tar -xzvf {} -C {mount_point} --no-same-owner --no-same-permissions",
                shell_quote(&archive)
            )],
        )
        .step("Listing boot partition", vec![format!("ls -la {mount_point}")])
        .step("Flushing to storage", vec!["sync".to_string()])
        .step("Unmounting boot partition", vec![format!("umount {mount_point}")]);

    vec![precheck.render(Stage::PreCheck), execute.render(Stage::Execute)]
}

fn module_steps(dir: &str, params: &ModuleParams) -> Vec<CommandStep> {
    let archive = remote_join(dir, &params.archive);
    let staging = remote_join(dir, &params.staging_dir);
    let tool = remote_join(&staging, &params.tool);
    let payload = remote_join(&staging, &params.payload);

    let script = Script::new()
        .step(
            "Checking package",
            vec![require_file(
                &archive,
                &format!("ERROR: {} not found in {}", params.archive, dir),
            )],
        )
        .step("Preparing staging directory", vec![format!("mkdir -p {}", shell_quote(&staging))])
        .step(
            "Extracting package",
            vec![format!(
                "tar -xzvf {} -C {}",
                shell_quote(&archive),
                shell_quote(&staging)
            )],
        )
        .step(
            "Checking upgrade tool",
            vec![require_file(
                &tool,
                &format!("ERROR: upgrade tool {} not found", params.tool),
            )],
        )
        .step(
            "Checking payload",
            vec![require_file(
                &payload,
                &format!("ERROR: payload {} not found", params.payload),
            )],
        )
        .step(
            "Running upgrade tool",
            vec![
                format!("chmod +x {}", shell_quote(&tool)),
                format!("cd {}", shell_quote(&staging)),
                format!("{} {}", shell_quote(&tool), shell_quote(&params.payload)),
            ],
        )
        .step("Flushing to storage", vec!["sync".to_string()]);

    vec![script.render(Stage::Execute)]
}

fn transfer_steps(local: PathBuf, remote: &str) -> Vec<CommandStep> {
    vec![
        CommandStep {
            stage: Stage::Execute,
            action: StepAction::Upload {
                local,
                remote: remote.to_string(),
            },
        },
        // no step markers: the first output line must be the checksum
        CommandStep {
            stage: Stage::Verify,
            action: StepAction::RemoteShell {
                fragments: vec![format!("sha256sum {}", shell_quote(remote))],
            },
        },
    ]
}
