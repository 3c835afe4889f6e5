//! Discovery descriptor under concurrent writers
//!
//! Several host processes share one descriptor; these tests stand in for
//! them with threads that each own a distinct pid.

use std::sync::{Arc, Barrier};
use std::thread;

use iobridge_core::discovery::{DiscoveryStore, UpdateOutcome};
use iobridge_core::{BrowserInfo, DownloadRoot, Profile};
use tempfile::TempDir;

fn profile(pid: u32) -> Profile {
    Profile {
        install_id: None,
        extension_id: None,
        salt: format!("salt-{}", pid),
        pid,
        port: 40_000 + pid as u16,
        token: format!("token-{}", pid),
        started: 1,
        last_used: 1,
        browser: BrowserInfo {
            name: "Chrome".into(),
            binary: String::new(),
            extension_id: None,
        },
        download_roots: Vec::new(),
    }
}

#[test]
fn test_concurrent_registers_never_lose_entries() {
    let temp = TempDir::new().unwrap();
    let store = DiscoveryStore::in_config_dir(temp.path());
    let writers = 12;
    let barrier = Arc::new(Barrier::new(writers));

    let handles: Vec<_> = (0..writers as u32)
        .map(|i| {
            let store = store.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let pid = 1000 + i;
                store.register(profile(pid)).unwrap();
                // Re-registering the same pid replaces, never duplicates
                store.register(profile(pid)).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let desc = store.read();
    assert_eq!(desc.profiles.len(), writers);
    for i in 0..writers as u32 {
        assert!(desc.find(1000 + i).is_some(), "pid {} missing", 1000 + i);
    }
}

#[test]
fn test_concurrent_updates_touch_only_their_entry() {
    let temp = TempDir::new().unwrap();
    let store = DiscoveryStore::in_config_dir(temp.path());
    for pid in 1..=6 {
        store.register(profile(pid)).unwrap();
    }

    let handles: Vec<_> = (1..=6u32)
        .map(|pid| {
            let store = store.clone();
            thread::spawn(move || {
                for round in 0..5 {
                    let outcome = store
                        .update(pid, |p| {
                            p.download_roots
                                .push(DownloadRoot::new(format!("/data/{}/{}", pid, round), "r"))
                        })
                        .unwrap();
                    assert_eq!(outcome, UpdateOutcome::Written);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let desc = store.read();
    for pid in 1..=6u32 {
        let entry = desc.find(pid).unwrap();
        assert_eq!(entry.download_roots.len(), 5);
        assert!(entry
            .download_roots
            .iter()
            .all(|r| r.path.starts_with(format!("/data/{}", pid))));
        assert_eq!(entry.token, format!("token-{}", pid));
    }
}

#[test]
fn test_handshake_on_fresh_profile_leaves_one_entry() {
    let temp = TempDir::new().unwrap();
    let store = DiscoveryStore::in_config_dir(temp.path());
    store.register(profile(77)).unwrap();

    let updated = store.attach_install(77, "install-a", Some("ext")).unwrap().unwrap();
    assert_eq!(updated.install_id.as_deref(), Some("install-a"));

    let desc = store.read();
    assert_eq!(desc.profiles.len(), 1);
    assert_eq!(desc.profiles[0].pid, 77);
}

#[test]
fn test_restart_adopts_roots_of_same_install() {
    let temp = TempDir::new().unwrap();
    let store = DiscoveryStore::in_config_dir(temp.path());

    let mut old = profile(10);
    old.install_id = Some("install-a".into());
    old.download_roots.push(DownloadRoot::new("/media/usb", "usb"));
    store.register(old).unwrap();

    // The old process is gone; the dormant entry is kept for adoption
    assert_eq!(store.prune_with(|pid| pid != 10).unwrap(), 0);

    store.register(profile(20)).unwrap();
    let updated = store.attach_install(20, "install-a", None).unwrap().unwrap();
    assert!(updated.download_roots.iter().any(|r| r.display_name == "usb"));

    let desc = store.read();
    assert_eq!(desc.profiles.len(), 1);
    assert_eq!(desc.profiles[0].pid, 20);
}
