//! End-to-end coverage of the Control Endpoint driven through `Service`
//! exactly as `fs.rs` would: open a session, write a newline-delimited
//! request, read back the newline-delimited response.

use std::fs;

use repeatfs::Service;

fn write_conf(dir: &std::path::Path, body: &str) {
    fs::write(dir.join("repeatfs.conf"), body).unwrap();
}

fn drain(service: &std::sync::Arc<Service>, descriptor: u64) -> String {
    let mut out = Vec::new();
    loop {
        let chunk = service.control.read(descriptor, 4096);
        if chunk.is_empty() {
            break;
        }
        out.extend(chunk);
    }
    String::from_utf8(out).unwrap()
}

#[test]
fn config_vdf_resets_a_real_vdf_entry() {
    let root = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();
    write_conf(
        root.path(),
        "[entry]\nmatch=\\.fastq$\next=.fasta\ncmd=cat {input}\noutput=stdout\n",
    );
    fs::write(root.path().join("x.fastq"), b"@r\nACGT\n+\nIIII\n").unwrap();

    let service = Service::new(root.path().to_path_buf(), mount.path().to_path_buf(), root.path()).unwrap();
    let descriptor = 1;
    service.control.open_session(descriptor);

    let request = serde_json::json!({"command": "config_vdf", "path": "x.fastq+/x.fastq.fasta", "options": {"foo": "bar"}});
    service.control.write(&service, descriptor, format!("{}\n", request).as_bytes());

    let response = drain(&service, descriptor);
    let parsed: serde_json::Value = serde_json::from_str(response.trim_end()).unwrap();
    assert_eq!(parsed["status"], "ok");
    assert_eq!(parsed["final"], true);

    service.control.close_session(descriptor);
}

#[test]
fn config_vdf_on_a_real_file_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();
    write_conf(root.path(), "[entry]\nmatch=\\.fastq$\next=.fasta\ncmd=cat {input}\noutput=stdout\n");
    fs::write(root.path().join("x.fastq"), b"data").unwrap();

    let service = Service::new(root.path().to_path_buf(), mount.path().to_path_buf(), root.path()).unwrap();
    let descriptor = 1;
    service.control.open_session(descriptor);

    let request = serde_json::json!({"command": "config_vdf", "path": "x.fastq", "options": {}});
    service.control.write(&service, descriptor, format!("{}\n", request).as_bytes());

    let response = drain(&service, descriptor);
    let parsed: serde_json::Value = serde_json::from_str(response.trim_end()).unwrap();
    assert_eq!(parsed["status"], "error");

    service.control.close_session(descriptor);
}

#[test]
fn malformed_request_reports_malformed_and_unknown_command_is_reported_separately() {
    let root = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();
    write_conf(root.path(), "[entry]\nmatch=\\.fastq$\next=.fasta\ncmd=cat {input}\noutput=stdout\n");

    let service = Service::new(root.path().to_path_buf(), mount.path().to_path_buf(), root.path()).unwrap();
    let descriptor = 1;
    service.control.open_session(descriptor);

    service.control.write(&service, descriptor, b"not json at all\n");
    let response = drain(&service, descriptor);
    let parsed: serde_json::Value = serde_json::from_str(response.trim_end()).unwrap();
    assert_eq!(parsed["status"], "malformed");

    service.control.write(&service, descriptor, b"{\"command\": \"frobnicate\"}\n");
    let response = drain(&service, descriptor);
    let parsed: serde_json::Value = serde_json::from_str(response.trim_end()).unwrap();
    assert_eq!(parsed["status"], "unknown");

    service.control.close_session(descriptor);
}
