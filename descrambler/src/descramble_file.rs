use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use descrambler_core::cipher::CipherType;
use descrambler_core::config::{ClientCommon, ClientConfig, ConstcwConfig, DescramblerConfig};
use descrambler_core::descrambler::Outcome;
use descrambler_core::ts::{self, TS_PACKET_SIZE, TS_SYNC_BYTE};
use descrambler_core::{ClientManager, Config, Service, ServiceInfo};

/// CA system the bench service is forced to, so the fixed-key client
/// matches without a PMT.
const BENCH_CAID: u16 = 0xffff;

#[derive(Args, Debug)]
pub struct DescrambleFile {
    /// Scrambled transport stream
    #[arg(long)]
    input: PathBuf,

    /// Where the descrambled stream is written
    #[arg(long)]
    output: PathBuf,

    /// csa, des_ncb, aes_ecb or aes128_ecb
    #[arg(long, default_value = "csa")]
    algorithm: CipherType,

    /// Even key, hex
    #[arg(long)]
    even: String,

    /// Odd key, hex
    #[arg(long)]
    odd: String,
}

impl DescrambleFile {
    pub async fn execute(self) -> Result<()> {
        let client = ConstcwConfig {
            common: ClientCommon {
                name: "bench".to_string(),
                ..ClientCommon::default()
            },
            algorithm: self.algorithm,
            caid: BENCH_CAID,
            key_even: self.even.clone(),
            key_odd: self.odd.clone(),
            ..ConstcwConfig::default()
        };
        let config = Config {
            clients: vec![ClientConfig::Constcw(client)],
            ..Config::default()
        };
        let manager = ClientManager::from_config(&config)?;
        manager.start();

        let service = Service::new(
            ServiceInfo {
                name: self.input.display().to_string(),
                force_caid: BENCH_CAID,
                ..ServiceInfo::default()
            },
            &DescramblerConfig::default(),
        );
        service.start_descrambling(&manager);

        let input = tokio::fs::read(&self.input)
            .await
            .with_context(|| format!("reading {}", self.input.display()))?;
        let mut output = Vec::with_capacity(input.len());
        let mut dropped = 0usize;
        let mut skipped = 0usize;
        for packet in input.chunks(TS_PACKET_SIZE) {
            if packet.len() != TS_PACKET_SIZE || packet[0] != TS_SYNC_BYTE {
                skipped += 1;
                continue;
            }
            let Some(pid) = ts::pid(packet) else {
                skipped += 1;
                continue;
            };
            match service.descramble(pid, packet, |out| output.extend_from_slice(out)) {
                Outcome::Consumed | Outcome::Buffered => {}
                Outcome::Dropped => dropped += 1,
                Outcome::Fatal => anyhow::bail!("descrambler stopped unexpectedly"),
            }
        }
        let stats = service.stats();
        service.stop_descrambling();
        manager.stop().await;

        tokio::fs::write(&self.output, &output)
            .await
            .with_context(|| format!("writing {}", self.output.display()))?;
        if skipped > 0 {
            warn!(skipped, "input contained invalid packets");
        }
        info!(
            packets = input.len() / TS_PACKET_SIZE,
            written = output.len() / TS_PACKET_SIZE,
            decrypted = stats.decrypted,
            dropped,
            output = %self.output.display(),
            "descrambling finished"
        );
        Ok(())
    }
}
