use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use futures::FutureExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use controller::*;

fn main() {
    use clap::{
        crate_authors, crate_description, crate_name, crate_version, value_parser, Arg, ArgAction,
        Command,
    };
    use std::process;
    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .args([
            Arg::new("kubeconfig")
                .long("kubeconfig")
                .env("CRSTATE_KUBECONFIG")
                .help("Path to a kubeconfig. Only required if out-of-cluster."),
            Arg::new("master")
                .long("master")
                .env("CRSTATE_MASTER")
                .help("The address of the Kubernetes API server. Overrides any value in the kubeconfig. Only required if out-of-cluster."),
            Arg::new("self_host")
                .long("self-host")
                .env("CRSTATE_SELF_HOST")
                .default_value("::")
                .help("Host to expose self (telemetry) metrics on."),
            Arg::new("self_port")
                .long("self-port")
                .env("CRSTATE_SELF_PORT")
                .default_value("9998")
                .value_parser(value_parser!(u16))
                .help("Port to expose self (telemetry) metrics on."),
            Arg::new("main_host")
                .long("main-host")
                .env("CRSTATE_MAIN_HOST")
                .default_value("::")
                .help("Host to expose main metrics on."),
            Arg::new("main_port")
                .long("main-port")
                .env("CRSTATE_MAIN_PORT")
                .default_value("9999")
                .value_parser(value_parser!(u16))
                .help("Port to expose main metrics on."),
            Arg::new("try_no_cache")
                .long("try-no-cache")
                .env("CRSTATE_TRY_NO_CACHE")
                .action(ArgAction::SetTrue)
                .help("Force the API server to serve the most recent versions on list and watch."),
            Arg::new("workers")
                .long("workers")
                .env("CRSTATE_WORKERS")
                .default_value("2")
                .value_parser(value_parser!(u16))
                .help("Number of concurrent reconciles."),
        ]);

    if let Err(e) = match Args::try_from(&cmd.get_matches()) {
        Ok(args) => startup(args),
        Err(e) => Err(Error::from(e)),
    } {
        eprintln!("{e}");
        process::exit(1);
    }
}

struct Args {
    kubeconfig: Option<String>,
    master: Option<String>,
    self_address: SocketAddr,
    main_address: SocketAddr,
    try_no_cache: bool,
    workers: u16,
}

impl TryFrom<&clap::ArgMatches> for Args {
    type Error = std::net::AddrParseError;

    fn try_from(m: &clap::ArgMatches) -> std::result::Result<Self, Self::Error> {
        let addr = |host: &str, port: u16| -> std::result::Result<SocketAddr, Self::Error> {
            Ok(SocketAddr::new(host.parse::<IpAddr>()?, port))
        };
        Ok(Self {
            kubeconfig: m.get_one::<String>("kubeconfig").cloned(),
            master: m.get_one::<String>("master").cloned(),
            self_address: addr(
                m.get_one::<String>("self_host").expect("has a default"),
                *m.get_one::<u16>("self_port").expect("has a default"),
            )?,
            main_address: addr(
                m.get_one::<String>("main_host").expect("has a default"),
                *m.get_one::<u16>("main_port").expect("has a default"),
            )?,
            try_no_cache: m.get_flag("try_no_cache"),
            workers: *m.get_one::<u16>("workers").expect("has a default"),
        })
    }
}

fn startup(args: Args) -> controller::Result<()> {
    use tokio::runtime;
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::prelude::*;

    let logger = tracing_subscriber::fmt::layer().json();
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let collector = tracing_subscriber::Registry::default()
        .with(logger)
        .with(env_filter);
    tracing::subscriber::set_global_default(collector)?;

    let handle = controller::metrics::install_recorder()?;

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(run(args, handle))
}

async fn run(args: Args, handle: PrometheusHandle) -> controller::Result<()> {
    use tokio::{signal, task};

    let client = build_client(&args).await?;
    let cancel = CancellationToken::new();
    let ctx = Arc::new(Context::new(client.clone(), args.try_no_cache, cancel.clone()));

    let mut ctrls = task::JoinSet::new();
    ctrls.spawn(monitors::controller(cancel.clone(), ctx.clone(), args.workers)?);
    ctrls.spawn(
        server::serve(
            "main",
            args.main_address,
            server::main_app(server::MainState {
                registry: ctx.registry.clone(),
                client: client.clone(),
            }),
            cancel.clone(),
        )
        .boxed(),
    );
    ctrls.spawn(
        server::serve(
            "telemetry",
            args.self_address,
            server::telemetry_app(server::TelemetryState {
                handle,
                client: client.clone(),
            }),
            cancel.clone(),
        )
        .boxed(),
    );

    let shutdown = cancel.clone();
    task::spawn(async move {
        use signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!("error installing SIGTERM handler: {err}");
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        info!("shutting down");
        shutdown.cancel();
    });

    info!("setup done, starting controller");
    while let Some(res) = ctrls.join_next().await {
        match res {
            Err(e) => error!("error joining task: {e}"),
            Ok(res) => {
                if let Err(e) = res {
                    error!("error from task: {e}");
                }
            }
        };
        // One task finishing (or failing) takes the rest down with it.
        cancel.cancel();
    }
    Ok(())
}

async fn build_client(args: &Args) -> controller::Result<kube::Client> {
    use kube::config::{Config, KubeConfigOptions, Kubeconfig};

    let mut config = match &args.kubeconfig {
        Some(path) => {
            Config::from_custom_kubeconfig(
                Kubeconfig::read_from(path)?,
                &KubeConfigOptions::default(),
            )
            .await?
        }
        None => Config::infer().await?,
    };
    if let Some(master) = &args.master {
        config.cluster_url = master
            .parse()
            .map_err(|err| Error::Configuration(format!("invalid master URL {master:?}: {err}")))?;
    }
    Ok(kube::Client::try_from(config)?)
}
