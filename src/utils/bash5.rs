// src/utils/bash5.rs: PacBio bas.h5 / bax.h5 reader (feature `bash5`)
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use hdf5_metno::types::VarLenAscii;
use hdf5_metno::File;
use log::{debug, info};

use crate::utils::ccs::{CcsRead, RawDataOpener, Zmw};
use crate::utils::file::split_root_from_ext;

const MULTIPART_PARTS: &str = "MultiPart/Parts";
const CCS_BASECALL: &str = "PulseData/ConsensusBaseCalls/Basecall";
const CCS_QUALITY: &str = "PulseData/ConsensusBaseCalls/QualityValue";
const CCS_NUM_EVENT: &str = "PulseData/ConsensusBaseCalls/ZMW/NumEvent";
const CCS_HOLE_NUMBER: &str = "PulseData/ConsensusBaseCalls/ZMW/HoleNumber";
const HQ_REGION_SNR: &str = "PulseData/BaseCalls/ZMWMetrics/HQRegionSNR";
const RUN_INFO: &str = "ScanData/RunInfo";


/// Opens raw files with HDF5. A multi-part bas.h5 is followed to its bax.h5 parts.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasH5Opener;

impl RawDataOpener for BasH5Opener {
    fn open(&self, path: &Path) -> Result<Vec<Zmw>> {
        let file = File::open(path)?;
        if file.link_exists(MULTIPART_PARTS) {
            let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
            let parts: Vec<VarLenAscii> = file.dataset(MULTIPART_PARTS)?.read_raw()?;
            let mut zmws = Vec::new();
            for part in parts {
                let part_path: PathBuf = base.join(part.as_str());
                debug!("Following multi-part entry {}", part_path.display());
                zmws.extend(read_part(&File::open(&part_path)?, &part_path)?);
            }
            return Ok(zmws);
        }
        read_part(&file, path)
    }
}

fn movie_name(file: &File, path: &Path) -> String {
    let from_attr = file
        .group(RUN_INFO)
        .and_then(|g| g.attr("MovieName"))
        .and_then(|a| a.read_scalar::<VarLenAscii>())
        .map(|name| name.as_str().to_string());
    match from_attr {
        Ok(name) if !name.is_empty() => name,
        _ => {
            // bax parts are named <movie>.<n>.bax.h5
            let (root, _) = split_root_from_ext(path);
            match root.rsplit_once('.') {
                Some((movie, part)) if part.chars().all(|c| c.is_ascii_digit()) => movie.to_string(),
                _ => root,
            }
        }
    }
}

fn read_part(file: &File, path: &Path) -> Result<Vec<Zmw>> {
    let movie = movie_name(file, path);
    let bases: Vec<u8> = file.dataset(CCS_BASECALL)?.read_raw()?;
    let quals: Vec<u8> = file.dataset(CCS_QUALITY)?.read_raw()?;
    let num_events: Vec<i32> = file.dataset(CCS_NUM_EVENT)?.read_raw()?;
    let holes: Vec<u32> = file.dataset(CCS_HOLE_NUMBER)?.read_raw()?;
    let snr = file.dataset(HQ_REGION_SNR)?.read_2d::<f32>()?;

    if num_events.len() != holes.len() || snr.nrows() != holes.len() {
        return Err(anyhow!("Inconsistent ZMW tables in {}", path.display()));
    }
    if bases.len() != quals.len() {
        return Err(anyhow!("Basecall and QualityValue lengths differ in {}", path.display()));
    }

    let mut zmws = Vec::with_capacity(holes.len());
    let mut offset = 0usize;
    for (i, (&events, &hole)) in num_events.iter().zip(holes.iter()).enumerate() {
        let len = events.max(0) as usize;
        let end = offset + len;
        if end > bases.len() {
            return Err(anyhow!("ZMW {} overruns the basecall table in {}", hole, path.display()));
        }
        let ccs = (len > 0).then(|| CcsRead {
            seq: bases[offset..end].to_vec(),
            qual: quals[offset..end].to_vec(),
        });
        zmws.push(Zmw {
            name: format!("{}/{}/ccs", movie, hole),
            ccs,
            snr: snr.row(i).to_vec(),
        });
        offset = end;
    }
    info!("Read {} ZMWs from {}", zmws.len(), path.display());
    Ok(zmws)
}
