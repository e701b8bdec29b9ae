//! El escritor de configuración contra el binario real de `propmerge`.

use common::{ConfigTarget, ConfigWriter, LineFormat, LocalShell, MergePolicy, PropertySet, SyncGate, WriteOutcome};
use std::fs;
use std::path::Path;
use std::sync::Arc;

const HOST: &str = "localhost";

fn writer(dir: &Path) -> ConfigWriter {
    let helper = Path::new(env!("CARGO_BIN_EXE_propmerge"));
    let helper_dir = dir.join("bin").to_string_lossy().to_string();
    ConfigWriter::new(Arc::new(SyncGate::new()), helper, helper_dir)
}

fn target(file: &str, format: LineFormat) -> ConfigTarget<'_> {
    ConfigTarget {
        file,
        format,
        policy: MergePolicy::Merge,
        elevated: false,
    }
}

#[tokio::test]
async fn xml_site_file_is_merged_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("hdfs-site.xml");
    fs::write(
        &file,
        "<?xml version=\"1.0\"?>\n\
         <configuration>\n\
         \x20 <property>\n\
         \x20   <name>dfs.replication</name>\n\
         \x20   <value>3</value>\n\
         \x20 </property>\n\
         </configuration>\n",
    )
    .unwrap();
    let file = file.to_string_lossy().to_string();

    let props = PropertySet::new()
        .with("dfs.replication", 1_i64)
        .with("dfs.nameservices", "wisilica");
    let out = writer(dir.path())
        .apply_properties(&LocalShell::new(), HOST, &target(&file, LineFormat::HadoopXml), &props)
        .await
        .unwrap();

    assert_eq!(out, WriteOutcome::Written { backup: Some(0) });
    assert_eq!(
        fs::read_to_string(&file).unwrap(),
        "<?xml version=\"1.0\"?>\n\
         <configuration>\n\
         \x20 <property><name>dfs.replication</name><value>1</value></property>\n\
         \x20 <property><name>dfs.nameservices</name><value>wisilica</value></property>\n\
         </configuration>\n"
    );
    assert!(fs::read_to_string(format!("{}.bak0", file)).unwrap().contains("<value>3</value>"));
}

#[tokio::test]
async fn one_line_root_is_not_duplicated() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("core-site.xml");
    fs::write(&file, "<configuration></configuration>\n").unwrap();
    let file = file.to_string_lossy().to_string();

    let props = PropertySet::new().with("fs.defaultFS", "hdfs://wisilica");
    writer(dir.path())
        .apply_properties(&LocalShell::new(), HOST, &target(&file, LineFormat::HadoopXml), &props)
        .await
        .unwrap();

    let merged = fs::read_to_string(&file).unwrap();
    assert_eq!(merged.matches("<configuration>").count(), 1);
    assert!(merged.ends_with(
        "  <property><name>fs.defaultFS</name><value>hdfs://wisilica</value></property>\n</configuration>\n"
    ));
}

#[tokio::test]
async fn hosts_file_keeps_foreign_lines() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("hosts");
    fs::write(&file, "127.0.0.1 localhost\n10.0.0.2 viejo\n").unwrap();
    let file = file.to_string_lossy().to_string();

    let props = PropertySet::new().with("10.0.0.1", "a").with("10.0.0.2", "b");
    let w = writer(dir.path());
    for _ in 0..2 {
        w.apply_properties(&LocalShell::new(), HOST, &target(&file, LineFormat::Hosts), &props)
            .await
            .unwrap();
    }

    assert_eq!(
        fs::read_to_string(&file).unwrap(),
        "127.0.0.1 localhost\n10.0.0.2 b\n10.0.0.1 a\n"
    );
}
