//! Attach an iSCSI LUN for two consumers and release it again
//!
//! Runs against in-memory collaborators unless `--live` is given, in which
//! case it uses iscsiadm and mount(2) and must run as root.
//!
//! ```text
//! cargo run --example attach_volume -- 10.0.0.1:3260 iqn.2015-01.com.example:disk1 0
//! sudo cargo run --example attach_volume -- 10.0.0.1:3260 iqn.2015-01.com.example:disk1 0 --live
//! ```

use iscsi_volume::exec::SystemRunner;
use iscsi_volume::fake::{FakeDiskManager, FakeMounter};
use iscsi_volume::{IscsiPlugin, IscsiVolumeSource, PluginConfig, VolumeResult, VolumeSpec};
use std::env;
use std::sync::Arc;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    let live = args.iter().any(|a| a == "--live");
    let positional: Vec<&String> = args.iter().skip(1).filter(|a| !a.starts_with("--")).collect();

    let portal = positional.first().map(|s| s.as_str()).unwrap_or("10.0.0.1:3260");
    let iqn = positional
        .get(1)
        .map(|s| s.as_str())
        .unwrap_or("iqn.2015-01.com.example:disk1");
    let lun = match positional.get(2).map(|s| s.parse::<u32>()) {
        Some(Ok(lun)) => lun,
        Some(Err(_)) => {
            eprintln!("LUN must be a non-negative integer");
            std::process::exit(2);
        }
        None => 0,
    };

    if let Err(e) = run(portal, iqn, lun, live) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(portal: &str, iqn: &str, lun: u32, live: bool) -> VolumeResult<()> {
    let root = env::temp_dir().join("iscsi-volume-demo");
    let config = PluginConfig::builder().root_dir(&root).build()?;

    let plugin = if live {
        IscsiPlugin::builder().config(config).build()?
    } else {
        IscsiPlugin::builder()
            .config(config)
            .disk_manager(Arc::new(FakeDiskManager::new(root.join("shared"))))
            .mounter(Arc::new(FakeMounter::new()))
            .runner(Arc::new(SystemRunner))
            .build()?
    };

    let spec = |read_only| {
        VolumeSpec::iscsi(
            "data",
            IscsiVolumeSource {
                target_portal: portal.to_string(),
                iqn: iqn.to_string(),
                lun,
                fs_type: String::new(),
                read_only,
            },
        )
    };

    if !plugin.can_support(&spec(false)) {
        println!(
            "{} not found: this host cannot serve iSCSI volumes",
            plugin.config().attach_tool()
        );
        return Ok(());
    }

    let writer = plugin.new_session(&spec(false), "consumer-a")?;
    let reader = plugin.new_session(&spec(true), "consumer-b")?;

    plugin.set_up(&writer)?;
    plugin.set_up(&reader)?;
    println!("writer: {}", plugin.volume_path(&writer).display());
    println!("reader: {}", plugin.volume_path(&reader).display());

    plugin.tear_down(&writer)?;
    println!("writer released, device still attached for reader");
    plugin.tear_down(&reader)?;
    println!("reader released, device detached");

    Ok(())
}
