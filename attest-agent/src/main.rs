// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use fs_err as fs;
use tpm2::{tpm_rh, Marshal, TpmsNvPublic, TpmtPublic, Unmarshal};
use tpm_attest::{
    anchor, AgentConfig, AnchorSelection, ApiError, Attestation, Backend, Entity, Name,
    StaticFirmware, TrustAnchor,
};
use tpm_types::{EnrollRequest, EnrollResponse, Evidence, HashAlgorithm, Verdict};
use tracing::warn;

/// TPM attestation agent utility
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the PCR banks of a TPM
    Pcrs(PcrsArgs),
    /// Show the endorsement key
    Ek(TpmArgs),
    /// Compute the (Qualified)Name of a path of entities
    Name(NameArgs),
    /// Collect attestation evidence from an enrolled device.
    ///
    /// The state file named by the configuration is written at enrollment
    /// by the program that owns the backend connection, through
    /// `tpm_attest::enroll_device` and `AgentConfig::save_state`.
    Attest(AttestArgs),
}

#[derive(Args)]
struct TpmArgs {
    /// TPM selection: a device path, mssim://host[:port], sgx://host[:port],
    /// net://host:port, dummy or system
    #[arg(long, default_value = "system")]
    tpm: String,
}

#[derive(Args)]
struct PcrsArgs {
    #[command(flatten)]
    tpm: TpmArgs,

    /// only show this bank
    #[arg(long)]
    bank: Option<HashAlgorithm>,
}

#[derive(Args)]
struct NameArgs {
    /// path entries, root first: handle:<hex>, public:<hex TPMT_PUBLIC>,
    /// nv:<hex TPMS_NV_PUBLIC> or name:<hex>
    #[arg(required = true)]
    path: Vec<String>,
}

#[derive(Args)]
struct AttestArgs {
    /// agent configuration file; its `state_file` must hold an enrolled
    /// key hierarchy
    #[arg(long)]
    config: PathBuf,

    /// firmware record (JSON) to bind into the quote
    #[arg(long)]
    firmware: PathBuf,

    /// print the evidence instead of submitting it
    #[arg(long)]
    dry_run: bool,
}

/// Stand-in for the backend client, which is not part of this tool
struct Offline;

impl Backend for Offline {
    fn enroll(&mut self, _request: &EnrollRequest) -> Result<EnrollResponse, ApiError> {
        Err(ApiError::NetworkUnreachable)
    }

    fn attest(&mut self, _evidence: &Evidence) -> Result<Verdict, ApiError> {
        Err(ApiError::NetworkUnreachable)
    }
}

fn report(err: tpm_attest::Error) -> anyhow::Error {
    err.trace_chain();
    anyhow!(err.diagnostic())
}

fn with_anchor<T>(
    selection: &str,
    f: impl FnOnce(&mut dyn TrustAnchor) -> tpm_attest::Result<T>,
) -> Result<T> {
    let selection = selection
        .parse::<AnchorSelection>()
        .map_err(|err| report(err.into()))?;
    let mut anchor = anchor::open(&selection, None).map_err(report)?;
    let result = f(anchor.as_mut());
    if let Err(err) = anchor.close() {
        warn!("failed to close TPM: {}", err.diagnostic());
    }
    result.map_err(report)
}

fn cmd_pcrs(args: PcrsArgs) -> Result<()> {
    let banks = with_anchor(&args.tpm.tpm, |anchor| anchor.all_pcr_values())?;
    for (bank, values) in banks {
        if args.bank.is_some_and(|wanted| wanted != bank) {
            continue;
        }
        for (index, value) in values {
            println!("{bank}[{index:2}] = {}", hex::encode(value));
        }
    }
    Ok(())
}

fn cmd_ek(args: TpmArgs) -> Result<()> {
    let (public, certificate) = with_anchor(&args.tpm, |anchor| {
        let certificate = anchor.read_ek_certificate()?;
        let (ek, public) = anchor.get_endorsement_key()?;
        anchor.flush(ek)?;
        Ok((public, certificate))
    })?;
    let name = tpm_attest::compute_name(&[
        Entity::Handle(tpm_rh::ENDORSEMENT),
        Entity::Public(&public),
    ])
    .map_err(report)?;
    println!("public: {}", hex::encode(public.to_bytes()));
    println!("qualified name: {}", hex::encode(name.to_bytes()));
    match certificate {
        Some(cert) => println!("certificate: {} bytes", cert.len()),
        None => println!("certificate: none"),
    }
    Ok(())
}

enum PathEntry {
    Handle(u32),
    Public(TpmtPublic),
    NvPublic(TpmsNvPublic),
    Name(Name),
}

fn parse_entry(entry: &str) -> Result<PathEntry> {
    let (kind, value) = entry
        .split_once(':')
        .with_context(|| format!("expected <kind>:<hex>, got {entry}"))?;
    let value = value.trim_start_matches("0x");
    let entry = match kind {
        "handle" => PathEntry::Handle(
            u32::from_str_radix(value, 16).with_context(|| format!("invalid handle {value}"))?,
        ),
        "public" => PathEntry::Public(TpmtPublic::from_bytes(&hex::decode(value)?)?),
        "nv" => PathEntry::NvPublic(TpmsNvPublic::from_bytes(&hex::decode(value)?)?),
        "name" => PathEntry::Name(Name::from_bytes(&hex::decode(value)?).map_err(report)?),
        other => bail!("unknown path entry kind {other}"),
    };
    Ok(entry)
}

fn cmd_name(args: NameArgs) -> Result<()> {
    let entries = args
        .path
        .iter()
        .map(|entry| parse_entry(entry))
        .collect::<Result<Vec<_>>>()?;
    let path: Vec<Entity> = entries
        .iter()
        .map(|entry| match entry {
            PathEntry::Handle(handle) => Entity::Handle(*handle),
            PathEntry::Public(public) => Entity::Public(public),
            PathEntry::NvPublic(public) => Entity::NvPublic(public),
            PathEntry::Name(name) => Entity::Name(name),
        })
        .collect();
    let name = tpm_attest::compute_name(&path).map_err(report)?;
    println!("{}", hex::encode(name.to_bytes()));
    Ok(())
}

fn cmd_attest(args: AttestArgs) -> Result<()> {
    let mut config = AgentConfig::load(&args.config)?;
    config.dry_run |= args.dry_run;
    let state = config.load_state()?.with_context(|| {
        format!(
            "device is not enrolled: {} does not exist, enroll through tpm_attest::enroll_device",
            config.state_file.display()
        )
    })?;
    let configuration = config.configuration()?;
    let firmware = fs::read(&args.firmware)?;

    let attestation = tpm_attest::attest(
        &config,
        &state,
        &configuration,
        &mut StaticFirmware(firmware),
        &mut Offline,
    )
    .map_err(report)?;
    match attestation {
        Attestation::DryRun(evidence) => {
            println!("{}", serde_json::to_string_pretty(&evidence)?);
        }
        Attestation::Appraised { classification, .. } => {
            for (domain, class) in classification {
                println!("{domain}: {class:?}");
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Pcrs(args) => cmd_pcrs(args)?,
        Commands::Ek(args) => cmd_ek(args)?,
        Commands::Name(args) => cmd_name(args)?,
        Commands::Attest(args) => cmd_attest(args)?,
    }

    Ok(())
}
