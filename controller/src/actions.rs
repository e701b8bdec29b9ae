//! Lo que cada paso hace en un host concreto.

use anyhow::{anyhow, bail, Context, Result};
use common::backup::{purge_backups, ManagedFile};
use common::remote::shell_quote;
use common::{ConfigTarget, HostRole, LineFormat, MergePolicy, PropertySet, RemoteCommand};
use tracing::{debug, info, warn};

use crate::plan::{Action, Package};
use crate::sites::SiteFile;
use crate::state::Session;

const INSTANCE_MOUNT: &str = "/mnt";

pub async fn perform(session: &Session, host: &str, action: &Action) -> Result<()> {
    match action {
        Action::InEnv { dir, command } => in_env(session, host, dir, command).await,
        Action::Shell { script, elevated } => {
            session
                .shell
                .run(host, &RemoteCommand::elevated_if(script.as_str(), *elevated))
                .await?;
            Ok(())
        }
        Action::SyncHelpers => sync_helpers(session, host).await,
        Action::InstallDependencies => install_dependencies(session, host).await,
        Action::CollectPublicKey => collect_public_key(session, host).await,
        Action::AuthorizeClusterKeys => authorize_cluster_keys(session, host).await,
        Action::ProbePrivateAddress => probe_private_address(session, host).await,
        Action::UpdateHostsFile => update_hosts_file(session, host).await,
        Action::WritePrivateIps => write_private_ips(session, host).await,
        Action::MountInstanceStorage => mount_instance_storage(session, host).await,
        Action::EnsureDirectories => ensure_directories(session, host).await,
        Action::InstallPackage(pkg) => install_package(session, host, *pkg).await,
        Action::WriteSite(file) => write_site(session, host, *file).await,
        Action::WriteMyid => write_myid(session, host).await,
        Action::RevertSite(file) => revert_site(session, host, *file).await,
        Action::Reset => reset(session, host).await,
    }
}

/// Script final de un comando de daemon: `cd <dir> && [wrapper env] cmd`.
pub async fn env_script(session: &Session, host: &str, dir: &str, command: &str) -> Result<String> {
    let paths = &session.settings.paths;
    if paths.env_file_autoloaded {
        return Ok(format!("cd {} && {}", shell_quote(dir), command));
    }

    session
        .gate
        .ensure_uploaded(session.shell.as_ref(), host, &session.env_wrapper, &paths.helper_dir)
        .await
        .with_context(|| format!("no se pudo subir el wrapper de entorno a {}", host))?;

    let wrapper = session
        .env_wrapper
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("wrapper de entorno sin nombre: {:?}", session.env_wrapper))?;

    Ok(format!(
        "cd {} && {}/{} {} {}",
        shell_quote(dir),
        paths.helper_dir.trim_end_matches('/'),
        wrapper,
        shell_quote(&paths.env_file),
        command
    ))
}

async fn in_env(session: &Session, host: &str, dir: &str, command: &str) -> Result<()> {
    let script = env_script(session, host, dir, command).await?;
    let out = session.shell.run(host, &RemoteCommand::new(script)).await?;
    if let Some(line) = out.first_line() {
        debug!("[{}] {}", host, line);
    }
    Ok(())
}

async fn sync_helpers(session: &Session, host: &str) -> Result<()> {
    let shell = session.shell.as_ref();
    session.writer.ensure_helper(shell, host).await?;
    if !session.settings.paths.env_file_autoloaded {
        session
            .gate
            .ensure_uploaded(shell, host, &session.env_wrapper, &session.settings.paths.helper_dir)
            .await
            .with_context(|| format!("no se pudo subir el wrapper de entorno a {}", host))?;
    }
    Ok(())
}

async fn install_dependencies(session: &Session, host: &str) -> Result<()> {
    let bootstrap = &session.settings.bootstrap;
    let shell = session.shell.as_ref();

    for pre in &bootstrap.pre_commands {
        if !shell.probe(host, &RemoteCommand::sudo(pre.as_str())).await {
            warn!("[{}] '{}' falló, sigo", host, pre);
        }
    }

    let mut missing = Vec::new();
    for req in &bootstrap.requirements {
        let script = bootstrap.package_install.replace("{}", req);
        if let Err(e) = shell.run(host, &RemoteCommand::sudo(script)).await {
            warn!("[{}] no se pudo instalar {}: {}", host, req, e);
            missing.push(req.as_str());
        }
    }
    if !missing.is_empty() {
        bail!("paquetes sin instalar: {}", missing.join(", "));
    }
    Ok(())
}

async fn collect_public_key(session: &Session, host: &str) -> Result<()> {
    let script = "test -f $HOME/.ssh/id_rsa || ssh-keygen -q -t rsa -N '' -f $HOME/.ssh/id_rsa; \
                  cat $HOME/.ssh/id_rsa.pub";
    let out = session.shell.run(host, &RemoteCommand::new(script)).await?;
    let key = out
        .first_line()
        .ok_or_else(|| anyhow!("{} no devolvió clave pública", host))?;
    session.record_public_key(host, key);
    Ok(())
}

/// Añade a `authorized_keys` las claves del resto de hosts del cluster.
async fn authorize_cluster_keys(session: &Session, host: &str) -> Result<()> {
    let keys = session.public_keys();
    let others: Vec<&String> = keys
        .iter()
        .filter(|(h, _)| h.as_str() != host)
        .map(|(_, k)| k)
        .collect();
    if others.is_empty() {
        debug!("[{}] sin claves que autorizar", host);
        return Ok(());
    }

    let mut script = String::from(
        "mkdir -p $HOME/.ssh && touch $HOME/.ssh/authorized_keys && chmod 600 $HOME/.ssh/authorized_keys",
    );
    for key in &others {
        let quoted = shell_quote(key);
        script.push_str(&format!(
            " && (grep -qxF {k} $HOME/.ssh/authorized_keys || echo {k} >> $HOME/.ssh/authorized_keys)",
            k = quoted
        ));
    }
    session.shell.run(host, &RemoteCommand::new(script)).await?;
    info!("[{}] {} claves autorizadas", host, others.len());
    Ok(())
}

async fn probe_private_address(session: &Session, host: &str) -> Result<()> {
    if let Some(known) = session.topology.private_address(host) {
        session.record_private_address(host, known);
        return Ok(());
    }

    let script = if session.settings.ec2.enabled {
        "wget -qO- http://instance-data/latest/meta-data/local-ipv4".to_string()
    } else {
        format!(
            "ip -4 -o addr show dev {} | awk '{{print $4}}' | cut -d/ -f1",
            shell_quote(&session.settings.hosts.net_interface)
        )
    };
    let out = session.shell.run(host, &RemoteCommand::new(script)).await?;
    let addr = out
        .first_line()
        .ok_or_else(|| anyhow!("{} no devolvió dirección privada", host))?;
    debug!("[{}] ip privada {}", host, addr);
    session.record_private_address(host, addr);
    Ok(())
}

/// Una línea `ip nombre` por host del cluster en el fichero de hosts.
async fn update_hosts_file(session: &Session, host: &str) -> Result<()> {
    let addresses = session.private_addresses();
    if addresses.is_empty() {
        bail!("no hay direcciones privadas que propagar");
    }
    let props: PropertySet = addresses
        .iter()
        .map(|(name, ip)| (ip.clone(), name.clone()))
        .collect();

    let target = ConfigTarget {
        file: &session.settings.paths.hosts_file,
        format: LineFormat::Hosts,
        policy: MergePolicy::Merge,
        elevated: true,
    };
    session
        .writer
        .apply_properties(session.shell.as_ref(), host, &target, &props)
        .await?;
    Ok(())
}

/// Inventario plano de IPs privadas, una por línea, en orden de topología.
async fn write_private_ips(session: &Session, host: &str) -> Result<()> {
    let addresses = session.private_addresses();
    let ips: Vec<String> = session
        .topology
        .hosts()
        .iter()
        .filter_map(|h| addresses.get(h))
        .map(|ip| shell_quote(ip))
        .collect();
    if ips.is_empty() {
        bail!("no hay direcciones privadas que escribir");
    }

    let script = format!(
        "printf '%s\\n' {} > {}",
        ips.join(" "),
        shell_quote(&session.settings.paths.private_ips_file)
    );
    session.shell.run(host, &RemoteCommand::new(script)).await?;
    Ok(())
}

async fn mount_instance_storage(session: &Session, host: &str) -> Result<()> {
    let Some(device) = session.settings.paths.instance_storage_device.as_deref() else {
        return Ok(());
    };
    let shell = session.shell.as_ref();
    if shell
        .probe(host, &RemoteCommand::new(format!("mountpoint -q {}", INSTANCE_MOUNT)))
        .await
    {
        debug!("[{}] {} ya montado", host, INSTANCE_MOUNT);
        return Ok(());
    }

    let dev = shell_quote(device);
    let script = format!(
        "mkfs.ext4 {dev} && mount {dev} {mnt} && chmod 0777 {mnt}",
        dev = dev,
        mnt = INSTANCE_MOUNT
    );
    shell.run(host, &RemoteCommand::sudo(script)).await?;
    info!("[{}] {} montado en {}", host, device, INSTANCE_MOUNT);
    Ok(())
}

async fn ensure_directories(session: &Session, host: &str) -> Result<()> {
    let settings = &session.settings;
    let shell = session.shell.as_ref();
    let mut dirs = settings.important_dirs();
    dirs.push(settings.paths.journal_dir.clone());

    for dir in dirs {
        let quoted = shell_quote(&dir);
        if shell
            .probe(host, &RemoteCommand::new(format!("test -d {}", quoted)))
            .await
        {
            continue;
        }
        let script = format!(
            "mkdir -p {d} && chown -R {u} {d} && chmod 755 {d}",
            d = quoted,
            u = shell_quote(&settings.cluster.ssh_user)
        );
        shell
            .run(host, &RemoteCommand::sudo(script))
            .await
            .with_context(|| format!("no se pudo crear {}", dir))?;
        debug!("[{}] creado {}", host, dir);
    }
    Ok(())
}

async fn install_package(session: &Session, host: &str, pkg: Package) -> Result<()> {
    let settings = &session.settings;
    let (name, url) = match pkg {
        Package::Hadoop => (settings.packages.hadoop_package(), settings.packages.hadoop_package_url()),
        Package::Zookeeper => (
            settings.packages.zookeeper_package(),
            settings.packages.zookeeper_package_url(),
        ),
    };
    let root = shell_quote(settings.paths.install_root.trim_end_matches('/'));
    let archive = shell_quote(&format!("{}.tar.gz", name));
    let shell = session.shell.as_ref();

    shell
        .run(host, &RemoteCommand::new(format!("mkdir -p {}", root)))
        .await?;

    let present = shell
        .probe(host, &RemoteCommand::new(format!("cd {} && test -f {}", root, archive)))
        .await;
    if present {
        debug!("[{}] reutilizo {}.tar.gz", host, name);
    } else {
        info!("[{}] descargando {}", host, url);
        shell
            .run(
                host,
                &RemoteCommand::new(format!(
                    "cd {} && wget -q -O {} {}",
                    root,
                    archive,
                    shell_quote(&url)
                )),
            )
            .await?;
    }

    shell
        .run(
            host,
            &RemoteCommand::new(format!("cd {} && tar --overwrite -xf {}", root, archive)),
        )
        .await?;
    info!("[{}] {} instalado", host, name);
    Ok(())
}

async fn write_site(session: &Session, host: &str, file: SiteFile) -> Result<()> {
    let path = file.path(&session.settings);
    let target = ConfigTarget {
        file: &path,
        format: file.format(),
        policy: file.policy(&session.settings),
        elevated: false,
    };
    session
        .writer
        .apply_properties(session.shell.as_ref(), host, &target, session.sites.get(file))
        .await?;
    Ok(())
}

async fn write_myid(session: &Session, host: &str) -> Result<()> {
    let Some(pos) = session.topology.quorum().iter().position(|h| h == host) else {
        debug!("[{}] no es miembro del quorum", host);
        return Ok(());
    };
    let data = shell_quote(&session.settings.paths.zookeeper_data);
    let script = format!("mkdir -p {d} && echo {id} > {d}/myid", d = data, id = pos + 1);
    session.shell.run(host, &RemoteCommand::new(script)).await?;
    Ok(())
}

async fn revert_site(session: &Session, host: &str, file: SiteFile) -> Result<()> {
    let managed = ManagedFile::new(file.path(&session.settings));
    if managed.revert(session.shell.as_ref(), host).await? {
        info!("[{}] {} revertido", host, file);
    } else {
        info!("[{}] {} sin backups que revertir", host, file);
    }
    Ok(())
}

/// Borra datos, logs y backups. Los fallos solo se avisan.
async fn reset(session: &Session, host: &str) -> Result<()> {
    let settings = &session.settings;
    let shell = session.shell.as_ref();

    let mut scripts: Vec<String> = settings
        .important_dirs()
        .iter()
        .chain(std::iter::once(&settings.paths.journal_dir))
        .map(|d| format!("rm -rf {}", shell_quote(d)))
        .collect();
    scripts.push(format!("rm -rf {}/logs/*", shell_quote(&settings.hadoop_prefix())));

    for script in scripts {
        if let Err(e) = shell.run(host, &RemoteCommand::sudo(script)).await {
            warn!("[{}] {}", host, e);
        }
    }
    for conf in [settings.hadoop_conf(), settings.zookeeper_conf()] {
        if let Err(e) = purge_backups(shell, host, &conf, true).await {
            warn!("[{}] {}", host, e);
        }
    }
    if session.topology.has_role(host, HostRole::Coordinator) {
        info!("[{}] datos del cluster borrados; hará falta `format`", host);
    }
    Ok(())
}
