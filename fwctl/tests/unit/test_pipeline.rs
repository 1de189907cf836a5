//! Pipeline and transport rendering tests

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use fwctl::models::job::{AuthMode, JobId, JobKind, RemoteTarget, UpgradeJob};
use fwctl::upgrade::pipeline::{build, PipelineParams, Stage, StepAction};
use fwctl::upgrade::transport::{SshTransport, SSHPASS_ENV};

const REMOTE_DIR: &str = "/media/sata/ue_data/";

fn job(kind: JobKind) -> UpgradeJob {
    UpgradeJob::new(JobId::new(), kind, REMOTE_DIR.to_string(), Duration::from_secs(60))
}

fn script_of(kind: JobKind, stage: Stage) -> String {
    let steps = build(&job(kind), &PipelineParams::default()).unwrap();
    steps
        .iter()
        .find(|step| step.stage == stage)
        .and_then(|step| step.action.script())
        .expect("stage has a shell script")
}

#[test]
fn test_stages_per_kind() {
    let params = PipelineParams::default();
    let stages = |kind| {
        build(&job(kind), &params)
            .unwrap()
            .iter()
            .map(|step| step.stage)
            .collect::<Vec<_>>()
    };

    assert_eq!(stages(JobKind::SoftwareUpgrade), vec![Stage::Execute]);
    assert_eq!(stages(JobKind::FirmwareUpgrade), vec![Stage::PreCheck, Stage::Execute]);
    assert_eq!(stages(JobKind::ModuleUpgrade), vec![Stage::Execute]);
}

#[test]
fn test_software_script() {
    let script = script_of(JobKind::SoftwareUpgrade, Stage::Execute);
    assert!(script.starts_with("echo 'Step 1/3: Checking package'"));
    assert!(script.contains("tar -xzvf '/media/sata/ue_data/qt_update.tar.gz' -C '/mnt/qtfs'"));
    assert!(script.ends_with("sync"));
}

#[test]
fn test_firmware_precheck_reports_missing_archive() {
    let script = script_of(JobKind::FirmwareUpgrade, Stage::PreCheck);
    assert!(script.contains("[ ! -b '/dev/mmcblk0p1' ]"));
    assert!(script.contains("tar -tzf '/media/sata/ue_data/boots.tar.gz'"));
    assert!(script.contains("echo 'ERROR: Firmware file not found'; exit 1"));
    assert!(script.contains("Step 4/4: Checking free space"));
}

#[test]
fn test_firmware_execute_unmounts_before_mounting() {
    let script = script_of(JobKind::FirmwareUpgrade, Stage::Execute);
    let release = script.find("then umount '/mnt/mmcblk0p1'").unwrap();
    let mount = script.find("mount '/dev/mmcblk0p1' '/mnt/mmcblk0p1'").unwrap();
    let extract = script.find("--no-same-owner --no-same-permissions").unwrap();
    let last_umount = script.rfind("umount '/mnt/mmcblk0p1'").unwrap();

    assert!(release < mount);
    assert!(mount < extract);
    assert!(extract < last_umount);
    assert!(script.contains("Step 8/8: Unmounting boot partition"));
}

#[test]
fn test_firmware_release_matches_whole_device() {
    let script = script_of(JobKind::FirmwareUpgrade, Stage::Execute);
    // /dev/mmcblk0p10 must not count as the boot partition
    assert!(script.contains("if mount | grep -q '^/dev/mmcblk0p1 '; then umount '/dev/mmcblk0p1'; fi"));
    assert!(!script.contains("grep -q '/dev/mmcblk0p1'"));
}

#[test]
fn test_module_script_checks_tool_and_payload_first() {
    let script = script_of(JobKind::ModuleUpgrade, Stage::Execute);
    let tool_check = script
        .find("echo 'ERROR: upgrade tool ku5pupgrade not found'")
        .unwrap();
    let payload_check = script
        .find("echo 'ERROR: payload ku5p_package.bit not found'")
        .unwrap();
    let run = script
        .find("'/media/sata/ue_data/updatepackage/ku5pupgrade' 'ku5p_package.bit'")
        .unwrap();

    assert!(tool_check < payload_check);
    assert!(payload_check < run);
    assert!(script.contains("Step 7/7: Flushing to storage"));
}

#[test]
fn test_custom_paths_are_quoted() {
    let mut params = PipelineParams::default();
    params.software.extract_path = "/mnt/it's here".to_string();
    let steps = build(&job(JobKind::SoftwareUpgrade), &params).unwrap();
    let script = steps[0].action.script().unwrap();
    assert!(script.contains(r"-C '/mnt/it'\''s here'"));
}

#[test]
fn test_transfer_steps() {
    let mut job = job(JobKind::FileTransfer);
    job.source_path = Some(PathBuf::from("/tmp/boots.tar.gz"));
    job.remote_path = "/media/sata/ue_data/boots.tar.gz".to_string();

    let steps = build(&job, &PipelineParams::default()).unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(
        steps[0].action,
        StepAction::Upload {
            local: PathBuf::from("/tmp/boots.tar.gz"),
            remote: "/media/sata/ue_data/boots.tar.gz".to_string(),
        }
    );
    assert_eq!(steps[1].stage, Stage::Verify);
    assert_eq!(
        steps[1].action.script().as_deref(),
        Some("sha256sum '/media/sata/ue_data/boots.tar.gz'")
    );
}

#[test]
fn test_transfer_without_source_is_rejected() {
    assert!(build(&job(JobKind::FileTransfer), &PipelineParams::default()).is_err());
}

#[test]
fn test_key_auth_rendering() {
    let target = RemoteTarget::new("10.1.2.3", 2222, "admin", AuthMode::Key);
    let transport = SshTransport::new(15);

    let ssh = transport.render(
        &target,
        &StepAction::RemoteShell {
            fragments: vec!["df -h".to_string(), "sync".to_string()],
        },
    );
    assert_eq!(ssh.program, "ssh");
    assert!(ssh.secret_env.is_none());
    assert!(ssh.args.contains(&"ConnectTimeout=15".to_string()));
    assert!(ssh.args.windows(2).any(|pair| pair == ["-p", "2222"]));
    assert_eq!(ssh.args.last().map(String::as_str), Some("df -h && sync"));

    let scp = transport.render(
        &target,
        &StepAction::Upload {
            local: PathBuf::from("/tmp/a.bin"),
            remote: "/data/a.bin".to_string(),
        },
    );
    assert_eq!(scp.program, "scp");
    assert!(scp.args.windows(2).any(|pair| pair == ["-P", "2222"]));
    assert_eq!(scp.args.last().map(String::as_str), Some("admin@10.1.2.3:/data/a.bin"));
}

#[test]
fn test_password_never_rendered() {
    let password = "s3cret-Passw0rd";
    let target = RemoteTarget::new(
        "10.1.2.3",
        22,
        "root",
        AuthMode::Password(SecretString::from(password.to_string())),
    );
    let spec = SshTransport::default().remote_shell(&target, "echo ok");

    assert_eq!(spec.program, "sshpass");
    assert_eq!(spec.args[0], "-e");
    assert_eq!(spec.args[1], "ssh");
    assert!(spec.args.iter().all(|arg| !arg.contains(password)));
    assert!(!spec.display().contains(password));
    assert!(!format!("{:?}", spec).contains(password));
    assert!(!format!("{:?}", target).contains(password));

    let (name, _) = spec.secret_env.as_ref().unwrap();
    assert_eq!(name, SSHPASS_ENV);
}
