//! End-to-end coverage across `Service`, the File Identity Resolver, and the
//! Block Cache Engine: a VDF is read all the way from a spawned command's
//! stdout, exercising the whole read path rather than any one module in
//! isolation.

use std::fs;

use repeatfs::cache::{IoOutcome, Operation};
use repeatfs::identity::Kind;
use repeatfs::Service;

fn write_conf(dir: &std::path::Path, body: &str) {
    fs::write(dir.join("repeatfs.conf"), body).unwrap();
}

#[test]
fn reading_a_vdf_drains_the_producing_commands_stdout() {
    let root = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();
    write_conf(
        root.path(),
        "block_size=64\n[entry]\nmatch=\\.fastq$\next=.fasta\ncmd=cat {input}\noutput=stdout\n",
    );
    fs::write(root.path().join("x.fastq"), b"@read1\nACGTACGT\n+\nIIIIIIII\n").unwrap();

    let service = Service::new(root.path().to_path_buf(), mount.path().to_path_buf(), root.path()).unwrap();

    let identity = service.resolver.resolve("x.fastq+/x.fastq.fasta");
    assert_eq!(identity.kind, Kind::Vdf);
    assert!(identity.valid);

    let entry = service.cache_entry(&identity).unwrap();
    let descriptor = service.descriptors.open(identity.clone(), Some(libc::O_RDONLY), std::process::id(), None);
    entry.register_descriptor(&service.descriptors, descriptor);

    let mut collected = Vec::new();
    loop {
        let outcome = entry
            .io(Operation::Read, collected.len() as u64, None, 64, descriptor, &service.descriptors, &service.history, None)
            .unwrap();
        match outcome {
            IoOutcome::Read(chunk) if !chunk.is_empty() => collected.extend(chunk),
            IoOutcome::Read(_) => break,
            IoOutcome::Written(_) => unreachable!(),
        }
    }

    assert_eq!(collected, b"@read1\nACGTACGT\n+\nIIIIIIII\n");
    assert!(entry.is_finalized());

    service.descriptors.close(descriptor);
    service.forget_cache_entry(&identity);
}

#[test]
fn unresolvable_vdf_basename_is_invalid() {
    let root = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();
    write_conf(root.path(), "[entry]\nmatch=\\.fastq$\next=.fasta\ncmd=cat {input}\noutput=stdout\n");
    fs::write(root.path().join("x.fastq"), b"data").unwrap();

    let service = Service::new(root.path().to_path_buf(), mount.path().to_path_buf(), root.path()).unwrap();

    let identity = service.resolver.resolve("x.fastq+/not_an_action.bin");
    assert!(!identity.valid);
}
