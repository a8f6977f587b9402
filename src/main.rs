// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Context, Error, Result};
use clap::Parser;
use env_logger;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::{
    collections::BTreeSet,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting haplomap with args: {:?}", cli_args);

    // Configure Rayon thread pool
    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    debug!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    match &cli_args.command {
        cli::Command::Filter(args) => run_filter(args)?,
        cli::Command::Tables(args) => run_tables(args)?,
        cli::Command::Map(args) => run_map(args)?,
    }

    info!(
        "haplomap finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

// --- Stage 1: allowlist + assessment filtering of the annotation table ---
fn run_filter(args: &cli::FilterArgs) -> Result<()> {
    let allowed = annotation::read_allowlist(&args.samples)?;
    info!(
        "Found {} distinct sample names in {}.",
        allowed.len(),
        args.samples.display()
    );

    let table = annotation::read_annotation(&args.annotation, args.sep)?;
    let cols = annotation::FilterColumns::resolve(&table)?;

    let retained = annotation::filter_rows(&table, &cols, &allowed);
    if retained.is_empty() {
        warn!("{}", errors::HaplomapError::EmptyInput);
    } else {
        info!(
            "Retained {} of {} rows after allowlist and PASS filtering.",
            retained.len(),
            table.rows.len()
        );
    }

    output_writer::write_filtered_annotation(&args.output, &table, &retained, args.sep)?;
    info!("Filtered annotation written to {}.", args.output.display());
    Ok(())
}

// --- Stage 2: per-population haplogroup frequency tables (Y & mtDNA) ---
fn run_tables(args: &cli::TablesArgs) -> Result<()> {
    let table = annotation::read_annotation(&args.input, args.sep)?;
    let cols = annotation::TableColumns::resolve(&table)?;

    let allowed = match &args.samples {
        Some(path) => {
            let ids = annotation::read_allowlist(path)?;
            info!(
                "Re-applying allowlist of {} sample names from {}.",
                ids.len(),
                path.display()
            );
            Some(ids)
        }
        None => None,
    };

    let records = annotation::extract_records(&table, &cols);
    debug!(
        "Extracted {} haplogroup observations from {} annotation rows.",
        records.len(),
        table.rows.len()
    );

    let filtered = annotation::filter_records(records, allowed.as_ref());
    if filtered.is_empty() {
        warn!("{}", errors::HaplomapError::EmptyInput);
    }

    let rows = frequency::aggregate(&filtered);
    let metas = frequency::partition_metadata(&filtered);

    for (system, path) in [
        (annotation::MarkerSystem::YChromosome, &args.y_output),
        (annotation::MarkerSystem::MtDna, &args.mt_output),
    ] {
        let row_count = rows.iter().filter(|r| r.marker_system == system).count();
        if row_count == 0 {
            warn!(
                "No {} haplogroup data found; skipping {}.",
                system.short_label(),
                path.display()
            );
            continue;
        }
        output_writer::write_frequency_table(path, system, &rows, &metas)?;
        info!(
            "{} haplogroup table -> {} ({} rows).",
            system.short_label(),
            path.display(),
            row_count
        );
    }
    Ok(())
}

// --- Stage 3: interactive map with dual-ring chart markers ---
fn run_map(args: &cli::MapArgs) -> Result<()> {
    let y_tables = geo::read_frequency_table(
        &args.y_input,
        args.sep,
        annotation::MarkerSystem::YChromosome,
    )?;
    let mt_tables =
        geo::read_frequency_table(&args.mt_input, args.sep, annotation::MarkerSystem::MtDna)?;

    let mut chart_labels = BTreeSet::new();
    for table in y_tables.iter().chain(mt_tables.iter()) {
        for row in &table.basal_rows {
            chart_labels.insert(row.basal_haplogroup.clone());
        }
        for children in table.subclades_by_parent.values() {
            for row in children {
                if let Some(subclade) = &row.subclade {
                    chart_labels.insert(subclade.clone());
                }
            }
        }
    }
    let palette = palette::build_palette(&chart_labels);
    debug!(
        "Assigned colors to {} distinct haplogroup labels.",
        palette.len()
    );

    let pb_style = ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} populations ({percent}%)",
        )
        .map_err(|e| anyhow!("Failed to create progress bar style: {}", e))?
        .progress_chars("=> ");
    let pb = ProgressBar::new((y_tables.len() + mt_tables.len()) as u64).with_style(pb_style);

    let mut markers = build_markers_with_progress(&y_tables, &pb)?;
    markers.extend(build_markers_with_progress(&mt_tables, &pb)?);
    pb.finish_with_message("Marker layout complete.");

    if markers.is_empty() {
        warn!("{}", errors::HaplomapError::EmptyInput);
    }

    let html = map_render::render_document(&markers, &palette)?;
    output_writer::write_atomic(&args.output, &html)?;
    info!(
        "Saved interactive map with {} markers to {}.",
        markers.len(),
        args.output.display()
    );
    Ok(())
}

fn build_markers_with_progress(
    tables: &[geo::PopulationTable],
    pb: &ProgressBar,
) -> Result<Vec<geo::PopulationMarker>> {
    let mut markers = tables
        .par_iter()
        .map(|table| {
            let marker = geo::build_marker(table);
            pb.inc(1);
            marker
        })
        .collect::<Result<Vec<_>, _>>()?;
    // Layout runs in parallel; re-sort for deterministic marker order.
    markers.sort_by(|a, b| a.population.cmp(&b.population));
    Ok(markers)
}

// --- Module Implementations ---

mod cli {
    use clap::{Parser, Subcommand};
    use std::path::PathBuf;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Haplogroup frequency mapping tool for ancient-DNA annotation tables.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        #[arg(long, default_value = "Info", global = true)]
        pub(crate) log_level: String,

        #[arg(short = 't', long, global = true)]
        pub(crate) threads: Option<usize>,

        #[command(subcommand)]
        pub(crate) command: Command,
    }

    #[derive(Subcommand, Debug)]
    pub(crate) enum Command {
        /// Retain annotation rows whose sample ID is allowlisted and whose assessment is PASS.
        Filter(FilterArgs),
        /// Build per-population basal/subclade haplogroup frequency tables (Y & mtDNA).
        Tables(TablesArgs),
        /// Render an interactive map with a dual-ring chart marker per population.
        Map(MapArgs),
    }

    #[derive(clap::Args, Debug)]
    pub(crate) struct FilterArgs {
        #[arg(short = 'a', long, required = true)]
        pub(crate) annotation: PathBuf,

        #[arg(short = 's', long, required = true)]
        pub(crate) samples: PathBuf,

        #[arg(short = 'o', long, default_value = "annotation_filtered.tsv")]
        pub(crate) output: PathBuf,

        #[arg(long, default_value_t = '\t')]
        pub(crate) sep: char,
    }

    #[derive(clap::Args, Debug)]
    pub(crate) struct TablesArgs {
        #[arg(long, required = true)]
        pub(crate) input: PathBuf,

        #[arg(short = 's', long)]
        pub(crate) samples: Option<PathBuf>,

        #[arg(long, default_value = "Y_haplogroup_frequencies.tsv")]
        pub(crate) y_output: PathBuf,

        #[arg(long, default_value = "mtDNA_haplogroup_frequencies.tsv")]
        pub(crate) mt_output: PathBuf,

        #[arg(long, default_value_t = '\t')]
        pub(crate) sep: char,
    }

    #[derive(clap::Args, Debug)]
    pub(crate) struct MapArgs {
        #[arg(long, required = true)]
        pub(crate) y_input: PathBuf,

        #[arg(long, required = true)]
        pub(crate) mt_input: PathBuf,

        #[arg(short = 'o', long, default_value = "haplogroup_map.html")]
        pub(crate) output: PathBuf,

        #[arg(long, default_value_t = '\t')]
        pub(crate) sep: char,
    }
}

mod errors {
    use std::path::PathBuf;
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub(crate) enum HaplomapError {
        #[error("input format error in {}: {}", .path.display(), .detail)]
        InputFormat { path: PathBuf, detail: String },

        #[error("data consistency error for population '{population}': {detail}")]
        DataConsistency { population: String, detail: String },

        #[error("no records survived filtering; downstream output will be empty")]
        EmptyInput,
    }
}

mod annotation {
    use super::errors::HaplomapError;
    use super::{debug, fs, info, warn, Context, File, Path, PathBuf, Result};
    use std::collections::HashSet;

    // Column headers follow the AADR annotation release convention.
    pub(crate) const COL_GENETIC_ID: &str = "Genetic ID";
    pub(crate) const COL_COUNTRY: &str = "Political Entity";
    pub(crate) const COL_AGE_BP: &str = "Date mean in BP in years before 1950 CE [OxCal mu for a direct radiocarbon date, and average of range for a contextual date]";
    pub(crate) const COL_LAT: &str = "Lat.";
    pub(crate) const COL_LON: &str = "Long.";
    pub(crate) const COL_Y_HAPLOGROUP: &str = "Y haplogroup (manual curation in ISOGG format)";
    pub(crate) const COL_MT_HAPLOGROUP: &str = "mtDNA haplogroup if >2x or published";
    pub(crate) const COL_ASSESSMENT: &str = "ASSESSMENT";

    const INVALID_CALLS: [&str; 4] = ["..", "n/a", "N/A", "Neanderthal"];

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub(crate) enum MarkerSystem {
        YChromosome,
        MtDna,
    }

    impl MarkerSystem {
        pub(crate) fn short_label(&self) -> &'static str {
            match self {
                MarkerSystem::YChromosome => "Y-chr",
                MarkerSystem::MtDna => "mtDNA",
            }
        }

        pub(crate) fn display_name(&self) -> &'static str {
            match self {
                MarkerSystem::YChromosome => "Y-chr haplogroup",
                MarkerSystem::MtDna => "mtDNA haplogroup",
            }
        }

        pub(crate) fn js_tag(&self) -> &'static str {
            match self {
                MarkerSystem::YChromosome => "Y",
                MarkerSystem::MtDna => "mt",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum QualityFlag {
        Pass,
        Fail,
    }

    impl QualityFlag {
        pub(crate) fn from_cell(cell: &str) -> Self {
            if cell.trim() == "PASS" {
                QualityFlag::Pass
            } else {
                QualityFlag::Fail
            }
        }
    }

    /// One haplogroup observation taken from an annotation row. A row yields
    /// up to two of these, one per marker system with a usable call.
    #[derive(Debug, Clone)]
    pub(crate) struct SampleRecord {
        pub(crate) sample_id: String,
        pub(crate) population: String,
        pub(crate) country: String,
        pub(crate) marker_system: MarkerSystem,
        pub(crate) haplogroup_call: String,
        pub(crate) quality: QualityFlag,
        pub(crate) age_bp: f64,
        pub(crate) lat: Option<f64>,
        pub(crate) lon: Option<f64>,
    }

    /// A SampleRecord that survived the quality and identity filter.
    #[derive(Debug, Clone)]
    pub(crate) struct FilteredRecord {
        pub(crate) sample_id: String,
        pub(crate) population: String,
        pub(crate) country: String,
        pub(crate) marker_system: MarkerSystem,
        pub(crate) haplogroup_call: String,
        pub(crate) age_bp: f64,
        pub(crate) lat: Option<f64>,
        pub(crate) lon: Option<f64>,
    }

    impl From<SampleRecord> for FilteredRecord {
        fn from(record: SampleRecord) -> Self {
            FilteredRecord {
                sample_id: record.sample_id,
                population: record.population,
                country: record.country,
                marker_system: record.marker_system,
                haplogroup_call: record.haplogroup_call,
                age_bp: record.age_bp,
                lat: record.lat,
                lon: record.lon,
            }
        }
    }

    #[derive(Debug)]
    pub(crate) struct AnnotationTable {
        pub(crate) path: PathBuf,
        pub(crate) headers: csv::StringRecord,
        pub(crate) rows: Vec<csv::StringRecord>,
    }

    impl AnnotationTable {
        pub(crate) fn from_reader<R: std::io::Read>(
            reader: R,
            sep: char,
            path: &Path,
        ) -> Result<Self> {
            let mut csv_reader = csv::ReaderBuilder::new()
                .delimiter(sep as u8)
                .has_headers(true)
                .trim(csv::Trim::All)
                .flexible(true)
                .from_reader(reader);
            let headers = csv_reader
                .headers()
                .with_context(|| format!("Failed to read header row from {}", path.display()))?
                .clone();
            let mut rows = Vec::new();
            for record in csv_reader.records() {
                rows.push(
                    record
                        .with_context(|| format!("Failed to parse a row in {}", path.display()))?,
                );
            }
            Ok(AnnotationTable {
                path: path.to_path_buf(),
                headers,
                rows,
            })
        }
    }

    pub(crate) fn read_annotation(path: &Path, sep: char) -> Result<AnnotationTable> {
        let file = File::open(path).with_context(|| {
            format!(
                "Annotation file '{}' not found or unreadable",
                path.display()
            )
        })?;
        let table = AnnotationTable::from_reader(file, sep, path)?;
        info!("Loaded {} rows from {}.", table.rows.len(), path.display());
        Ok(table)
    }

    /// Resolves the given header names to column indices, collecting every
    /// missing name into a single InputFormat error.
    pub(crate) fn resolve_columns(
        headers: &csv::StringRecord,
        required: &[&str],
        path: &Path,
    ) -> Result<Vec<usize>, HaplomapError> {
        let mut indices = Vec::with_capacity(required.len());
        let mut missing = Vec::new();
        for &name in required {
            match headers.iter().position(|h| h == name) {
                Some(idx) => indices.push(idx),
                None => missing.push(name),
            }
        }
        if !missing.is_empty() {
            return Err(HaplomapError::InputFormat {
                path: path.to_path_buf(),
                detail: format!("missing required column(s): {}", missing.join(", ")),
            });
        }
        Ok(indices)
    }

    pub(crate) fn find_column(headers: &csv::StringRecord, name: &str) -> Option<usize> {
        headers.iter().position(|h| h == name)
    }

    pub(crate) fn cell<'a>(row: &'a csv::StringRecord, idx: usize) -> &'a str {
        row.get(idx).unwrap_or("")
    }

    pub(crate) fn optional_f64(value: &str) -> Option<f64> {
        value.parse::<f64>().ok().filter(|v| v.is_finite())
    }

    #[derive(Debug)]
    pub(crate) struct FilterColumns {
        pub(crate) genetic_id: usize,
        pub(crate) assessment: usize,
    }

    impl FilterColumns {
        pub(crate) fn resolve(table: &AnnotationTable) -> Result<Self, HaplomapError> {
            let idx = resolve_columns(
                &table.headers,
                &[COL_GENETIC_ID, COL_ASSESSMENT],
                &table.path,
            )?;
            Ok(FilterColumns {
                genetic_id: idx[0],
                assessment: idx[1],
            })
        }
    }

    #[derive(Debug)]
    pub(crate) struct TableColumns {
        pub(crate) genetic_id: usize,
        pub(crate) country: usize,
        pub(crate) age_bp: usize,
        pub(crate) lat: usize,
        pub(crate) lon: usize,
        pub(crate) assessment: usize,
        pub(crate) y_haplogroup: Option<usize>,
        pub(crate) mt_haplogroup: Option<usize>,
    }

    impl TableColumns {
        pub(crate) fn resolve(table: &AnnotationTable) -> Result<Self, HaplomapError> {
            let idx = resolve_columns(
                &table.headers,
                &[
                    COL_GENETIC_ID,
                    COL_COUNTRY,
                    COL_AGE_BP,
                    COL_LAT,
                    COL_LON,
                    COL_ASSESSMENT,
                ],
                &table.path,
            )?;
            let y_haplogroup = find_column(&table.headers, COL_Y_HAPLOGROUP);
            if y_haplogroup.is_none() {
                warn!(
                    "Y haplogroup column '{}' not found in {}; the Y table will be empty.",
                    COL_Y_HAPLOGROUP,
                    table.path.display()
                );
            }
            let mt_haplogroup = find_column(&table.headers, COL_MT_HAPLOGROUP);
            if mt_haplogroup.is_none() {
                warn!(
                    "mtDNA haplogroup column '{}' not found in {}; the mtDNA table will be empty.",
                    COL_MT_HAPLOGROUP,
                    table.path.display()
                );
            }
            Ok(TableColumns {
                genetic_id: idx[0],
                country: idx[1],
                age_bp: idx[2],
                lat: idx[3],
                lon: idx[4],
                assessment: idx[5],
                y_haplogroup,
                mt_haplogroup,
            })
        }
    }

    /// Row-level filter used by the `filter` stage: keeps the indices of rows
    /// whose sample ID is allowlisted and whose assessment is PASS, in input
    /// order, so the stage can re-emit the original columns untouched.
    pub(crate) fn filter_rows(
        table: &AnnotationTable,
        cols: &FilterColumns,
        allowed: &HashSet<String>,
    ) -> Vec<usize> {
        table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                QualityFlag::from_cell(cell(row, cols.assessment)) == QualityFlag::Pass
                    && allowed.contains(cell(row, cols.genetic_id))
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Record-level filter: quality PASS plus, when an allowlist is given,
    /// membership in it. Preserves input ordering; an empty result is valid.
    pub(crate) fn filter_records(
        records: Vec<SampleRecord>,
        allowed: Option<&HashSet<String>>,
    ) -> Vec<FilteredRecord> {
        records
            .into_iter()
            .filter(|record| {
                record.quality == QualityFlag::Pass
                    && allowed.map_or(true, |ids| ids.contains(&record.sample_id))
            })
            .map(FilteredRecord::from)
            .collect()
    }

    pub(crate) fn extract_records(
        table: &AnnotationTable,
        cols: &TableColumns,
    ) -> Vec<SampleRecord> {
        let mut records = Vec::new();
        for row in &table.rows {
            let age_cell = cell(row, cols.age_bp);
            let age_bp = match optional_f64(age_cell) {
                Some(v) => v,
                None => {
                    debug!(
                        "Skipping sample '{}': unparsable age '{}'.",
                        cell(row, cols.genetic_id),
                        age_cell
                    );
                    continue;
                }
            };
            let country = cell(row, cols.country).to_string();
            let population = population_label(&country, age_bp);
            let quality = QualityFlag::from_cell(cell(row, cols.assessment));
            let lat = optional_f64(cell(row, cols.lat));
            let lon = optional_f64(cell(row, cols.lon));
            for (system, col) in [
                (MarkerSystem::YChromosome, cols.y_haplogroup),
                (MarkerSystem::MtDna, cols.mt_haplogroup),
            ] {
                if let Some(col) = col {
                    if let Some(call) = usable_call(cell(row, col)) {
                        records.push(SampleRecord {
                            sample_id: cell(row, cols.genetic_id).to_string(),
                            population: population.clone(),
                            country: country.clone(),
                            marker_system: system,
                            haplogroup_call: call.to_string(),
                            quality,
                            age_bp,
                            lat,
                            lon,
                        });
                    }
                }
            }
        }
        records
    }

    /// A call is usable when it is a single letter or its second character is
    /// a digit; anything else (multi-letter clades, junk markers) is dropped.
    pub(crate) fn usable_call(raw: &str) -> Option<&str> {
        let call = raw.trim();
        if call.is_empty() || INVALID_CALLS.contains(&call) {
            return None;
        }
        let mut chars = call.chars();
        let first = chars.next()?;
        if !first.is_ascii_alphabetic() {
            return None;
        }
        match chars.next() {
            None => Some(call),
            Some(second) if second.is_ascii_digit() => Some(call),
            Some(_) => None,
        }
    }

    pub(crate) fn basal_of(call: &str) -> String {
        call.chars()
            .next()
            .map(|c| c.to_ascii_uppercase().to_string())
            .unwrap_or_default()
    }

    pub(crate) fn subclade_of(call: &str) -> Option<String> {
        let mut chars = call.chars();
        let first = chars.next()?;
        let second = chars.next()?;
        if second.is_ascii_digit() {
            Some(format!("{}{}", first.to_ascii_uppercase(), second))
        } else {
            None
        }
    }

    /// Populations are 1000-year BP bins within a political entity, e.g.
    /// "Italy 2000-3000 BP".
    pub(crate) fn population_label(country: &str, age_bp: f64) -> String {
        let lower = (age_bp / 1000.0).floor() as i64 * 1000;
        format!("{} {}-{} BP", country, lower, lower + 1000)
    }

    pub(crate) fn calendar_year(age_bp: f64) -> i64 {
        (1950.0 - age_bp).round() as i64
    }

    pub(crate) fn format_calendar_year(year: i64) -> String {
        match year {
            y if y > 0 => format!("{} CE", y),
            y if y < 0 => format!("{} BCE", -y),
            _ => "0 CE".to_string(),
        }
    }

    pub(crate) fn parse_allowlist(text: &str) -> HashSet<String> {
        text.lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let first = fields.next()?;
                Some(fields.next().unwrap_or(first).to_string())
            })
            .collect()
    }

    pub(crate) fn read_allowlist(path: &Path) -> Result<HashSet<String>> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Samples file '{}' not found or unreadable", path.display()))?;
        let ids = parse_allowlist(&text);
        if ids.is_empty() {
            return Err(HaplomapError::InputFormat {
                path: path.to_path_buf(),
                detail: "no sample identifiers found in allowlist".to_string(),
            }
            .into());
        }
        Ok(ids)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn table_from(text: &str) -> AnnotationTable {
            AnnotationTable::from_reader(text.as_bytes(), '\t', Path::new("test.tsv")).unwrap()
        }

        fn small_header() -> String {
            [
                COL_GENETIC_ID,
                COL_COUNTRY,
                COL_AGE_BP,
                COL_LAT,
                COL_LON,
                COL_Y_HAPLOGROUP,
                COL_MT_HAPLOGROUP,
                COL_ASSESSMENT,
            ]
            .join("\t")
        }

        #[test]
        fn missing_columns_are_reported_together() {
            let table = table_from("Genetic ID\tLat.\nI001\t45.0\n");
            let err = TableColumns::resolve(&table).unwrap_err();
            match err {
                HaplomapError::InputFormat { detail, .. } => {
                    assert!(detail.contains(COL_COUNTRY));
                    assert!(detail.contains(COL_ASSESSMENT));
                    assert!(!detail.contains("Lat."));
                }
                other => panic!("expected InputFormat, got {:?}", other),
            }
        }

        #[test]
        fn missing_assessment_column_fails_filter_resolution() {
            let table = table_from("Genetic ID\tLat.\nI001\t45.0\n");
            let err = FilterColumns::resolve(&table).unwrap_err();
            match err {
                HaplomapError::InputFormat { detail, .. } => {
                    assert!(detail.contains(COL_ASSESSMENT))
                }
                other => panic!("expected InputFormat, got {:?}", other),
            }
        }

        #[test]
        fn call_hygiene_drops_junk_and_multi_letter_clades() {
            assert_eq!(usable_call(" R1b1a2 "), Some("R1b1a2"));
            assert_eq!(usable_call("H"), Some("H"));
            assert_eq!(usable_call("HV"), None);
            assert_eq!(usable_call(".."), None);
            assert_eq!(usable_call("n/a"), None);
            assert_eq!(usable_call("N/A"), None);
            assert_eq!(usable_call("Neanderthal"), None);
            assert_eq!(usable_call(""), None);
            assert_eq!(usable_call("1a"), None);
        }

        #[test]
        fn basal_and_subclade_parsing() {
            assert_eq!(basal_of("r1b1a2"), "R");
            assert_eq!(subclade_of("r1b1a2"), Some("R1".to_string()));
            assert_eq!(basal_of("H"), "H");
            assert_eq!(subclade_of("H"), None);
            assert_eq!(subclade_of("Ha"), None);
        }

        #[test]
        fn population_labels_bin_by_millennium() {
            assert_eq!(population_label("Italy", 2500.0), "Italy 2000-3000 BP");
            assert_eq!(population_label("Italy", 2000.0), "Italy 2000-3000 BP");
            assert_eq!(population_label("Italy", 1999.9), "Italy 1000-2000 BP");
            assert_eq!(population_label("Chile", 0.0), "Chile 0-1000 BP");
        }

        #[test]
        fn calendar_year_formatting() {
            assert_eq!(format_calendar_year(calendar_year(250.0)), "1700 CE");
            assert_eq!(format_calendar_year(calendar_year(3500.0)), "1550 BCE");
            assert_eq!(format_calendar_year(calendar_year(1950.0)), "0 CE");
        }

        #[test]
        fn allowlist_accepts_one_and_two_column_formats() {
            let ids = parse_allowlist("1 I001\n2 I002\n");
            assert!(ids.contains("I001") && ids.contains("I002"));
            let ids = parse_allowlist("I003\n\nI004\n");
            assert!(ids.contains("I003") && ids.contains("I004"));
            assert_eq!(ids.len(), 2);
        }

        #[test]
        fn extraction_yields_one_record_per_marker_system() {
            let text = format!(
                "{}\nI001\tItaly\t2500\t42.5\t13.2\tR1b1a2\tH1a\tPASS\n",
                small_header()
            );
            let table = table_from(&text);
            let cols = TableColumns::resolve(&table).unwrap();
            let records = extract_records(&table, &cols);
            assert_eq!(records.len(), 2);
            assert_eq!(records[0].marker_system, MarkerSystem::YChromosome);
            assert_eq!(records[0].haplogroup_call, "R1b1a2");
            assert_eq!(records[1].marker_system, MarkerSystem::MtDna);
            assert_eq!(records[1].population, "Italy 2000-3000 BP");
        }

        #[test]
        fn extraction_skips_rows_without_parseable_age() {
            let text = format!(
                "{}\nI001\tItaly\t..\t42.5\t13.2\tR1a\tH1\tPASS\n",
                small_header()
            );
            let table = table_from(&text);
            let cols = TableColumns::resolve(&table).unwrap();
            assert!(extract_records(&table, &cols).is_empty());
        }

        #[test]
        fn record_filter_enforces_quality_and_allowlist() {
            let text = format!(
                "{}\nI001\tItaly\t2500\t42.5\t13.2\tR1a\t\tPASS\n\
                 I002\tItaly\t2500\t42.5\t13.2\tR1b\t\tFAIL\n\
                 I003\tItaly\t2500\t42.5\t13.2\tR1c\t\tPASS\n",
                small_header()
            );
            let table = table_from(&text);
            let cols = TableColumns::resolve(&table).unwrap();
            let records = extract_records(&table, &cols);
            let allowed: std::collections::HashSet<String> =
                ["I001", "I002"].iter().map(|s| s.to_string()).collect();
            let filtered = filter_records(records.clone(), Some(&allowed));
            assert_eq!(filtered.len(), 1);
            assert_eq!(filtered[0].sample_id, "I001");

            // Without an allowlist only the quality flag applies.
            let filtered = filter_records(records, None);
            assert_eq!(filtered.len(), 2);
            assert_eq!(filtered[0].sample_id, "I001");
            assert_eq!(filtered[1].sample_id, "I003");
        }

        #[test]
        fn row_filter_preserves_order_and_passthrough_indices() {
            let text = format!(
                "{}\nI003\tItaly\t2500\t42.5\t13.2\tR1a\t\tPASS\n\
                 I001\tItaly\t2500\t42.5\t13.2\tR1b\t\tPASS\n\
                 I002\tItaly\t2500\t42.5\t13.2\tR1c\t\tFAIL\n",
                small_header()
            );
            let table = table_from(&text);
            let cols = FilterColumns::resolve(&table).unwrap();
            let allowed: std::collections::HashSet<String> = ["I001", "I002", "I003"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            assert_eq!(filter_rows(&table, &cols, &allowed), vec![0, 1]);
        }
    }
}

mod frequency {
    use super::annotation::{self, FilteredRecord, MarkerSystem};
    use std::cmp::Ordering;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct HaplogroupFrequencyRow {
        pub(crate) population: String,
        pub(crate) marker_system: MarkerSystem,
        pub(crate) basal_haplogroup: String,
        pub(crate) subclade: Option<String>,
        pub(crate) count: u32,
        pub(crate) frequency: f64,
    }

    #[derive(Debug, Clone)]
    pub(crate) struct PartitionMeta {
        pub(crate) country: String,
        pub(crate) mean_age_bp: f64,
        pub(crate) lat: Option<f64>,
        pub(crate) lon: Option<f64>,
        pub(crate) total: u32,
    }

    pub(crate) fn order_by_frequency_then_label(
        freq_a: f64,
        label_a: &str,
        freq_b: f64,
        label_b: &str,
    ) -> Ordering {
        freq_b
            .partial_cmp(&freq_a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| label_a.cmp(label_b))
    }

    /// Groups records by (population, marker system) and emits basal rows with
    /// frequency relative to the partition, each followed by its subclade rows
    /// with frequency relative to the parent's count. Populations with zero
    /// records simply never appear.
    pub(crate) fn aggregate(records: &[FilteredRecord]) -> Vec<HaplogroupFrequencyRow> {
        let mut partitions: BTreeMap<(String, MarkerSystem), Vec<&FilteredRecord>> =
            BTreeMap::new();
        for record in records {
            partitions
                .entry((record.population.clone(), record.marker_system))
                .or_default()
                .push(record);
        }

        let mut out = Vec::new();
        for ((population, system), members) in &partitions {
            let total = members.len() as u32;
            let mut basal_counts: BTreeMap<String, u32> = BTreeMap::new();
            let mut sub_counts: BTreeMap<String, BTreeMap<String, u32>> = BTreeMap::new();
            for record in members {
                let basal = annotation::basal_of(&record.haplogroup_call);
                *basal_counts.entry(basal.clone()).or_insert(0) += 1;
                if let Some(subclade) = annotation::subclade_of(&record.haplogroup_call) {
                    *sub_counts
                        .entry(basal)
                        .or_default()
                        .entry(subclade)
                        .or_insert(0) += 1;
                }
            }

            let mut basal_sorted: Vec<(&String, &u32)> = basal_counts.iter().collect();
            basal_sorted.sort_by(|a, b| {
                order_by_frequency_then_label(
                    f64::from(*a.1) / f64::from(total),
                    a.0,
                    f64::from(*b.1) / f64::from(total),
                    b.0,
                )
            });

            for (basal, count) in basal_sorted {
                out.push(HaplogroupFrequencyRow {
                    population: population.clone(),
                    marker_system: *system,
                    basal_haplogroup: basal.clone(),
                    subclade: None,
                    count: *count,
                    frequency: f64::from(*count) / f64::from(total),
                });
                if let Some(children) = sub_counts.get(basal) {
                    let mut children_sorted: Vec<(&String, &u32)> = children.iter().collect();
                    children_sorted.sort_by(|a, b| {
                        order_by_frequency_then_label(
                            f64::from(*a.1) / f64::from(*count),
                            a.0,
                            f64::from(*b.1) / f64::from(*count),
                            b.0,
                        )
                    });
                    for (subclade, sub_count) in children_sorted {
                        out.push(HaplogroupFrequencyRow {
                            population: population.clone(),
                            marker_system: *system,
                            basal_haplogroup: basal.clone(),
                            subclade: Some(subclade.clone()),
                            count: *sub_count,
                            frequency: f64::from(*sub_count) / f64::from(*count),
                        });
                    }
                }
            }
        }
        out
    }

    #[derive(Default)]
    struct MetaAccumulator {
        country: String,
        total: u32,
        age_sum: f64,
        lat_sum: f64,
        lat_n: u32,
        lon_sum: f64,
        lon_n: u32,
    }

    /// Per-partition metadata (coordinate and age means, sample totals) for
    /// the frequency table writer; aggregated from the same filtered records.
    pub(crate) fn partition_metadata(
        records: &[FilteredRecord],
    ) -> BTreeMap<(String, MarkerSystem), PartitionMeta> {
        let mut acc: BTreeMap<(String, MarkerSystem), MetaAccumulator> = BTreeMap::new();
        for record in records {
            let entry = acc
                .entry((record.population.clone(), record.marker_system))
                .or_default();
            entry.total += 1;
            entry.age_sum += record.age_bp;
            if entry.country.is_empty() {
                entry.country = record.country.clone();
            }
            if let Some(lat) = record.lat {
                entry.lat_sum += lat;
                entry.lat_n += 1;
            }
            if let Some(lon) = record.lon {
                entry.lon_sum += lon;
                entry.lon_n += 1;
            }
        }
        acc.into_iter()
            .map(|(key, a)| {
                let meta = PartitionMeta {
                    country: a.country,
                    mean_age_bp: a.age_sum / f64::from(a.total),
                    lat: (a.lat_n > 0).then(|| a.lat_sum / f64::from(a.lat_n)),
                    lon: (a.lon_n > 0).then(|| a.lon_sum / f64::from(a.lon_n)),
                    total: a.total,
                };
                (key, meta)
            })
            .collect()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn record(call: &str, system: MarkerSystem) -> FilteredRecord {
            FilteredRecord {
                sample_id: "S".to_string(),
                population: "Italy 2000-3000 BP".to_string(),
                country: "Italy".to_string(),
                marker_system: system,
                haplogroup_call: call.to_string(),
                age_bp: 2500.0,
                lat: Some(42.0),
                lon: Some(13.0),
            }
        }

        #[test]
        fn basal_frequencies_sum_to_one_and_order_is_deterministic() {
            let records: Vec<FilteredRecord> = ["A1", "A1", "A2", "B", "B2"]
                .iter()
                .map(|c| record(c, MarkerSystem::YChromosome))
                .collect();
            let rows = aggregate(&records);

            let basal: Vec<&HaplogroupFrequencyRow> =
                rows.iter().filter(|r| r.subclade.is_none()).collect();
            assert_eq!(basal.len(), 2);
            assert_eq!(basal[0].basal_haplogroup, "A");
            assert!((basal[0].frequency - 0.6).abs() < 1e-12);
            assert_eq!(basal[1].basal_haplogroup, "B");
            assert!((basal[1].frequency - 0.4).abs() < 1e-12);
            assert!((basal.iter().map(|r| r.frequency).sum::<f64>() - 1.0).abs() < 1e-12);

            // Children sit directly after their parent, ordered by frequency.
            assert_eq!(rows[1].subclade.as_deref(), Some("A1"));
            assert_eq!(rows[1].count, 2);
            assert!((rows[1].frequency - 2.0 / 3.0).abs() < 1e-12);
            assert_eq!(rows[2].subclade.as_deref(), Some("A2"));
            assert_eq!(rows[4].subclade.as_deref(), Some("B2"));
            assert!((rows[4].frequency - 0.5).abs() < 1e-12);
        }

        #[test]
        fn tied_counts_break_alphabetically() {
            let records: Vec<FilteredRecord> = ["C1", "B1", "A1"]
                .iter()
                .map(|c| record(c, MarkerSystem::MtDna))
                .collect();
            let rows = aggregate(&records);
            let basal: Vec<&str> = rows
                .iter()
                .filter(|r| r.subclade.is_none())
                .map(|r| r.basal_haplogroup.as_str())
                .collect();
            assert_eq!(basal, vec!["A", "B", "C"]);
        }

        #[test]
        fn basal_group_without_subclades_yields_no_child_rows() {
            let records: Vec<FilteredRecord> = ["H", "H", "H"]
                .iter()
                .map(|c| record(c, MarkerSystem::MtDna))
                .collect();
            let rows = aggregate(&records);
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].basal_haplogroup, "H");
            assert_eq!(rows[0].subclade, None);
        }

        #[test]
        fn empty_input_aggregates_to_nothing() {
            assert!(aggregate(&[]).is_empty());
        }

        #[test]
        fn marker_systems_partition_independently() {
            let records = vec![
                record("A1", MarkerSystem::YChromosome),
                record("H1", MarkerSystem::MtDna),
            ];
            let rows = aggregate(&records);
            let y: Vec<_> = rows
                .iter()
                .filter(|r| r.marker_system == MarkerSystem::YChromosome && r.subclade.is_none())
                .collect();
            assert_eq!(y.len(), 1);
            assert!((y[0].frequency - 1.0).abs() < 1e-12);
        }

        #[test]
        fn metadata_averages_coordinates_and_ages() {
            let mut a = record("A1", MarkerSystem::YChromosome);
            a.lat = Some(40.0);
            a.age_bp = 2000.0;
            let mut b = record("B1", MarkerSystem::YChromosome);
            b.lat = Some(44.0);
            b.age_bp = 3000.0;
            let mut c = record("C1", MarkerSystem::YChromosome);
            c.lat = None;
            c.age_bp = 2500.0;
            let metas = partition_metadata(&[a, b, c]);
            let meta = metas
                .get(&("Italy 2000-3000 BP".to_string(), MarkerSystem::YChromosome))
                .unwrap();
            assert_eq!(meta.total, 3);
            assert!((meta.mean_age_bp - 2500.0).abs() < 1e-12);
            assert!((meta.lat.unwrap() - 42.0).abs() < 1e-12);
            assert_eq!(meta.country, "Italy");
        }
    }
}

mod layout {
    use super::errors::HaplomapError;
    use super::frequency::{order_by_frequency_then_label, HaplogroupFrequencyRow};
    use std::collections::BTreeMap;

    pub(crate) const FREQ_SUM_TOLERANCE: f64 = 1e-6;
    pub(crate) const UNDETERMINED_LABEL: &str = "undetermined subtype";

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Ring {
        Inner,
        Outer,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum SliceKind {
        Basal,
        Subclade,
        Undetermined,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct RingSlice {
        pub(crate) start_angle: f64,
        pub(crate) end_angle: f64,
        pub(crate) label: String,
        pub(crate) ring: Ring,
        pub(crate) parent_label: Option<String>,
        pub(crate) kind: SliceKind,
    }

    impl RingSlice {
        pub(crate) fn span(&self) -> f64 {
            self.end_angle - self.start_angle
        }
    }

    /// Lays out the inner (basal) and outer (subclade) rings for one
    /// population and marker system.
    ///
    /// Slice boundaries come from a cumulative frequency accumulator, so
    /// per-slice rounding cannot accumulate into a gap at the 360°/0° seam;
    /// the final boundary of each ring is pinned to its exact end. A basal
    /// slice without subclade rows gets a single covering outer slice tagged
    /// as undetermined, keeping the two rings aligned edge-to-edge.
    pub(crate) fn layout(
        population: &str,
        basal_rows: &[HaplogroupFrequencyRow],
        subclades_by_parent: &BTreeMap<String, Vec<HaplogroupFrequencyRow>>,
    ) -> Result<(Vec<RingSlice>, Vec<RingSlice>), HaplomapError> {
        if basal_rows.is_empty() {
            return Err(HaplomapError::DataConsistency {
                population: population.to_string(),
                detail: "no basal haplogroup rows to lay out".to_string(),
            });
        }
        let total: f64 = basal_rows.iter().map(|r| r.frequency).sum();
        if (total - 1.0).abs() > FREQ_SUM_TOLERANCE {
            return Err(HaplomapError::DataConsistency {
                population: population.to_string(),
                detail: format!(
                    "basal haplogroup frequencies sum to {:.8}, expected 1.0",
                    total
                ),
            });
        }
        for parent in subclades_by_parent.keys() {
            if !basal_rows.iter().any(|r| &r.basal_haplogroup == parent) {
                return Err(HaplomapError::DataConsistency {
                    population: population.to_string(),
                    detail: format!(
                        "subclade rows reference unknown basal haplogroup '{}'",
                        parent
                    ),
                });
            }
        }

        let mut ordered: Vec<&HaplogroupFrequencyRow> = basal_rows.iter().collect();
        ordered.sort_by(|a, b| {
            order_by_frequency_then_label(
                a.frequency,
                &a.basal_haplogroup,
                b.frequency,
                &b.basal_haplogroup,
            )
        });

        let mut inner = Vec::with_capacity(ordered.len());
        let mut outer = Vec::new();
        let mut cumulative = 0.0_f64;
        let last_idx = ordered.len() - 1;

        for (idx, row) in ordered.iter().enumerate() {
            let start = cumulative * 360.0;
            cumulative += row.frequency;
            let end = if idx == last_idx {
                360.0
            } else {
                cumulative * 360.0
            };
            inner.push(RingSlice {
                start_angle: start,
                end_angle: end,
                label: row.basal_haplogroup.clone(),
                ring: Ring::Inner,
                parent_label: None,
                kind: SliceKind::Basal,
            });

            let children = subclades_by_parent
                .get(&row.basal_haplogroup)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            if children.is_empty() {
                outer.push(RingSlice {
                    start_angle: start,
                    end_angle: end,
                    label: UNDETERMINED_LABEL.to_string(),
                    ring: Ring::Outer,
                    parent_label: Some(row.basal_haplogroup.clone()),
                    kind: SliceKind::Undetermined,
                });
                continue;
            }

            let mut child_order: Vec<&HaplogroupFrequencyRow> = children.iter().collect();
            child_order.sort_by(|a, b| {
                order_by_frequency_then_label(
                    a.frequency,
                    a.subclade.as_deref().unwrap_or(""),
                    b.frequency,
                    b.subclade.as_deref().unwrap_or(""),
                )
            });
            let child_total: f64 = child_order.iter().map(|c| c.frequency).sum();
            let span = end - start;
            let mut child_cumulative = 0.0_f64;
            let child_last = child_order.len() - 1;
            for (cidx, child) in child_order.iter().enumerate() {
                let child_start = start + span * (child_cumulative / child_total);
                child_cumulative += child.frequency;
                let child_end = if cidx == child_last {
                    end
                } else {
                    start + span * (child_cumulative / child_total)
                };
                let label = child
                    .subclade
                    .clone()
                    .unwrap_or_else(|| child.basal_haplogroup.clone());
                outer.push(RingSlice {
                    start_angle: child_start,
                    end_angle: child_end,
                    label,
                    ring: Ring::Outer,
                    parent_label: Some(row.basal_haplogroup.clone()),
                    kind: SliceKind::Subclade,
                });
            }
        }
        Ok((inner, outer))
    }

}

mod palette {
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::collections::{BTreeSet, HashMap};

    // Fixed seed keeps the rendered artifact byte-identical across runs.
    const PALETTE_SEED: u64 = 42;

    /// Assigns each label an rgba color: hues ladder over the sorted label
    /// set, saturation and value are jittered per label.
    pub(crate) fn build_palette(labels: &BTreeSet<String>) -> HashMap<String, String> {
        let n = labels.len();
        let mut map = HashMap::with_capacity(n);
        if n == 0 {
            return map;
        }
        let mut rng = ChaCha8Rng::seed_from_u64(PALETTE_SEED);
        for (i, label) in labels.iter().enumerate() {
            let h = i as f64 / n as f64;
            let s = 0.65 + 0.35 * rng.random::<f64>();
            let v = 0.8 + 0.2 * rng.random::<f64>();
            let (r, g, b) = hsv_to_rgb(h, s, v);
            map.insert(label.clone(), format!("rgba({}, {}, {}, 0.75)", r, g, b));
        }
        map
    }

    fn hsv_to_rgb(h: f64, s: f64, v: f64) -> (u8, u8, u8) {
        let i = (h * 6.0).floor();
        let f = h * 6.0 - i;
        let p = v * (1.0 - s);
        let q = v * (1.0 - s * f);
        let t = v * (1.0 - s * (1.0 - f));
        let (r, g, b) = match (i as i64).rem_euclid(6) {
            0 => (v, t, p),
            1 => (q, v, p),
            2 => (p, v, t),
            3 => (p, q, v),
            4 => (t, p, v),
            _ => (v, p, q),
        };
        (
            (r * 255.0).round() as u8,
            (g * 255.0).round() as u8,
            (b * 255.0).round() as u8,
        )
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn palette_is_deterministic_across_runs() {
            let labels: BTreeSet<String> = ["A", "A1", "B", "H", "H1"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            assert_eq!(build_palette(&labels), build_palette(&labels));
        }

        #[test]
        fn every_label_gets_an_rgba_color() {
            let labels: BTreeSet<String> = ["A", "B"].iter().map(|s| s.to_string()).collect();
            let palette = build_palette(&labels);
            assert_eq!(palette.len(), 2);
            for color in palette.values() {
                assert!(color.starts_with("rgba(") && color.ends_with(", 0.75)"));
            }
        }

        #[test]
        fn empty_label_set_yields_empty_palette() {
            assert!(build_palette(&BTreeSet::new()).is_empty());
        }

        #[test]
        fn pure_hues_convert_exactly() {
            assert_eq!(hsv_to_rgb(0.0, 1.0, 1.0), (255, 0, 0));
            assert_eq!(hsv_to_rgb(1.0 / 3.0, 1.0, 1.0), (0, 255, 0));
            assert_eq!(hsv_to_rgb(2.0 / 3.0, 1.0, 1.0), (0, 0, 255));
        }
    }
}

mod geo {
    use super::annotation::{self, MarkerSystem};
    use super::errors::HaplomapError;
    use super::frequency::HaplogroupFrequencyRow;
    use super::layout::{self, RingSlice};
    use super::{info, Context, File, Path, Result};
    use std::collections::btree_map::Entry;
    use std::collections::BTreeMap;

    const FREQ_TABLE_COLUMNS: [&str; 11] = [
        "population",
        "country",
        "age",
        "bp",
        "lat",
        "lon",
        "basal_haplogroup",
        "subclade",
        "count",
        "frequency",
        "total",
    ];

    /// One population's share of a frequency table, regrouped for layout.
    #[derive(Debug, Clone)]
    pub(crate) struct PopulationTable {
        pub(crate) population: String,
        pub(crate) country: String,
        pub(crate) age_label: String,
        pub(crate) year: i64,
        pub(crate) lat: Option<f64>,
        pub(crate) lon: Option<f64>,
        pub(crate) total: u32,
        pub(crate) marker_system: MarkerSystem,
        pub(crate) basal_rows: Vec<HaplogroupFrequencyRow>,
        pub(crate) subclades_by_parent: BTreeMap<String, Vec<HaplogroupFrequencyRow>>,
    }

    #[derive(Debug, Clone)]
    pub(crate) struct PopulationMarker {
        pub(crate) population: String,
        pub(crate) country: String,
        pub(crate) age_label: String,
        pub(crate) year: i64,
        pub(crate) total: u32,
        pub(crate) marker_system: MarkerSystem,
        pub(crate) lat: f64,
        pub(crate) lon: f64,
        pub(crate) inner_ring: Vec<RingSlice>,
        pub(crate) outer_ring: Vec<RingSlice>,
    }

    pub(crate) fn read_frequency_table(
        path: &Path,
        sep: char,
        system: MarkerSystem,
    ) -> Result<Vec<PopulationTable>> {
        let file = File::open(path).with_context(|| {
            format!(
                "Frequency table '{}' not found or unreadable",
                path.display()
            )
        })?;
        let tables = parse_frequency_table(file, sep, system, path)?;
        info!(
            "Loaded {} {} populations from {}.",
            tables.len(),
            system.short_label(),
            path.display()
        );
        Ok(tables)
    }

    pub(crate) fn parse_frequency_table<R: std::io::Read>(
        reader: R,
        sep: char,
        system: MarkerSystem,
        path: &Path,
    ) -> Result<Vec<PopulationTable>, HaplomapError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(sep as u8)
            .has_headers(true)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);
        let headers = csv_reader
            .headers()
            .map_err(|e| HaplomapError::InputFormat {
                path: path.to_path_buf(),
                detail: format!("unreadable header row: {}", e),
            })?
            .clone();
        let idx = annotation::resolve_columns(&headers, &FREQ_TABLE_COLUMNS, path)?;
        let (idx_pop, idx_country, idx_age, idx_bp, idx_lat, idx_lon) =
            (idx[0], idx[1], idx[2], idx[3], idx[4], idx[5]);
        let (idx_basal, idx_subclade, idx_count, idx_freq, idx_total) =
            (idx[6], idx[7], idx[8], idx[9], idx[10]);

        let mut tables: BTreeMap<String, PopulationTable> = BTreeMap::new();
        for record in csv_reader.records() {
            let row = record.map_err(|e| HaplomapError::InputFormat {
                path: path.to_path_buf(),
                detail: format!("unreadable row: {}", e),
            })?;
            let population = annotation::cell(&row, idx_pop).to_string();
            let table = match tables.entry(population.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let bp = required_f64(annotation::cell(&row, idx_bp), "bp", path)?;
                    let total = required_u32(annotation::cell(&row, idx_total), "total", path)?;
                    entry.insert(PopulationTable {
                        population: population.clone(),
                        country: annotation::cell(&row, idx_country).to_string(),
                        age_label: annotation::cell(&row, idx_age).to_string(),
                        year: annotation::calendar_year(bp),
                        lat: annotation::optional_f64(annotation::cell(&row, idx_lat)),
                        lon: annotation::optional_f64(annotation::cell(&row, idx_lon)),
                        total,
                        marker_system: system,
                        basal_rows: Vec::new(),
                        subclades_by_parent: BTreeMap::new(),
                    })
                }
            };

            let basal = annotation::cell(&row, idx_basal).to_string();
            let subclade_cell = annotation::cell(&row, idx_subclade);
            let freq_row = HaplogroupFrequencyRow {
                population,
                marker_system: system,
                basal_haplogroup: basal.clone(),
                subclade: if subclade_cell.is_empty() {
                    None
                } else {
                    Some(subclade_cell.to_string())
                },
                count: required_u32(annotation::cell(&row, idx_count), "count", path)?,
                frequency: required_f64(annotation::cell(&row, idx_freq), "frequency", path)?,
            };
            if freq_row.subclade.is_some() {
                table
                    .subclades_by_parent
                    .entry(basal)
                    .or_default()
                    .push(freq_row);
            } else {
                table.basal_rows.push(freq_row);
            }
        }
        Ok(tables.into_values().collect())
    }

    pub(crate) fn build_marker(table: &PopulationTable) -> Result<PopulationMarker, HaplomapError> {
        let (lat, lon) = match (table.lat, table.lon) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => {
                return Err(HaplomapError::DataConsistency {
                    population: table.population.clone(),
                    detail: "no usable coordinates for this population".to_string(),
                })
            }
        };
        let (inner_ring, outer_ring) = layout::layout(
            &table.population,
            &table.basal_rows,
            &table.subclades_by_parent,
        )?;
        Ok(PopulationMarker {
            population: table.population.clone(),
            country: table.country.clone(),
            age_label: table.age_label.clone(),
            year: table.year,
            total: table.total,
            marker_system: table.marker_system,
            lat,
            lon,
            inner_ring,
            outer_ring,
        })
    }

    fn required_f64(value: &str, column: &str, path: &Path) -> Result<f64, HaplomapError> {
        value.parse::<f64>().map_err(|_| HaplomapError::InputFormat {
            path: path.to_path_buf(),
            detail: format!("unparsable numeric value '{}' in column '{}'", value, column),
        })
    }

    fn required_u32(value: &str, column: &str, path: &Path) -> Result<u32, HaplomapError> {
        value.parse::<u32>().map_err(|_| HaplomapError::InputFormat {
            path: path.to_path_buf(),
            detail: format!("unparsable count value '{}' in column '{}'", value, column),
        })
    }

}

mod map_render {
    use super::annotation::MarkerSystem;
    use super::geo::PopulationMarker;
    use super::layout::SliceKind;
    use super::Result;
    use std::collections::HashMap;
    use std::fmt::Write as FmtWrite;

    const DOC_HEAD: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8"/>
<meta name="viewport" content="width=device-width, initial-scale=1"/>
<title>Haplogroup frequency map</title>
<link rel="stylesheet" href="https://unpkg.com/leaflet@1.9.4/dist/leaflet.css"/>
<script src="https://unpkg.com/leaflet@1.9.4/dist/leaflet.js"></script>
<script src="https://cdn.jsdelivr.net/npm/chart.js"></script>
<script src="https://cdn.jsdelivr.net/npm/chartjs-plugin-datalabels@2.0.0"></script>
<style>
html, body { height: 100%; margin: 0; }
#map { height: 100%; }
#filterControl {
  position: absolute; top: 10px; left: 54px; z-index: 1000;
  background: #fff; padding: 10px; border-radius: 4px;
  box-shadow: 0 1px 5px rgba(0, 0, 0, 0.4);
  font: 13px Arial, Helvetica, sans-serif;
}
#filterControl select { width: 100%; margin-top: 5px; padding: 4px; }
#filterControl .systemToggles { margin-top: 8px; }
</style>
</head>
<body>
<div id="map"></div>
<div id="filterControl">
  <label for="ageDropdown"><strong>Select age interval:</strong></label><br>
  <select id="ageDropdown">
    <option value="all">All ages</option>
    <option value="-100000,-7000">Before 7000 BCE</option>
    <option value="-7000,-6000">7000-6000 BCE</option>
    <option value="-6000,-5000">6000-5000 BCE</option>
    <option value="-5000,-4000">5000-4000 BCE</option>
    <option value="-4000,-3000">4000-3000 BCE</option>
    <option value="-3000,-2500">3000-2500 BCE</option>
    <option value="-2500,-2000">2500-2000 BCE</option>
    <option value="-2000,-1500">2000-1500 BCE</option>
    <option value="-1500,-1000">1500-1000 BCE</option>
    <option value="-1000,-500">1000-500 BCE</option>
    <option value="-500,0">500-0 BCE</option>
    <option value="0,500">0-500 CE</option>
    <option value="500,1000">500-1000 CE</option>
    <option value="1000,1500">1000-1500 CE</option>
    <option value="1500,2000">1500-2000 CE</option>
    <option value="2000,100000">After 2000 CE</option>
  </select>
  <div class="systemToggles">
    <input type="checkbox" id="showYChr" checked><label for="showYChr"> Y-chr</label>
    <input type="checkbox" id="showMtDNA" checked style="margin-left: 10px;"><label for="showMtDNA"> mtDNA</label>
  </div>
</div>
"#;

    const MAP_SETUP: &str = r#"L.tileLayer('https://tile.openstreetmap.org/{z}/{x}/{y}.png', {
  maxZoom: 19,
  attribution: '&copy; <a href="https://www.openstreetmap.org/copyright">OpenStreetMap</a> contributors'
}).addTo(map);
var fgY = L.layerGroup().addTo(map);
var fgMt = L.layerGroup().addTo(map);
L.control.layers(null, { 'Y-chr': fgY, 'mtDNA': fgMt }, { position: 'topright' }).addTo(map);
"#;

    const CHART_JS: &str = r#"Chart.register(ChartDataLabels);
function haploChartConfig(p) {
  return {
    type: 'doughnut',
    data: {
      labels: p.labels,
      datasets: [
        { label: 'Subclades (outer)', data: p.outer, backgroundColor: p.colors, borderAlign: 'inner', borderWidth: 1 },
        { label: 'Basal (inner)', data: p.inner, backgroundColor: p.colors, borderAlign: 'inner', borderWidth: 1 }
      ]
    },
    options: {
      responsive: false,
      cutout: '50%',
      plugins: {
        legend: {
          position: 'right',
          labels: {
            filter: function (item) { return !p.placeholder[item.index]; }
          }
        },
        tooltip: {
          callbacks: {
            label: function (ctx) {
              if (p.placeholder[ctx.dataIndex]) { return null; }
              return ctx.label + ': ' + ctx.raw.toFixed(2) + '%';
            }
          }
        },
        datalabels: {
          display: function (ctx) {
            var val = ctx.dataset.data[ctx.dataIndex];
            return val > 0 && !p.placeholder[ctx.dataIndex];
          },
          formatter: function (value, ctx) {
            var lbl = ctx.chart.data.labels[ctx.dataIndex];
            if (ctx.datasetIndex === 0) {
              var disp = p.display[ctx.dataIndex];
              return lbl + (disp !== null ? ' ' + disp.toFixed(1) + '%' : '');
            }
            return lbl;
          },
          color: '#000',
          font: { weight: 'bold', size: 12 }
        }
      }
    }
  };
}
map.on('popupopen', function (e) {
  var canvas = e.popup.getElement().querySelector('canvas.haplo-chart');
  if (!canvas) { return; }
  var payload = chartPayloads[canvas.id];
  if (!payload) { return; }
  new Chart(canvas.getContext('2d'), haploChartConfig(payload));
});
"#;

    const FILTER_JS: &str = r#"var currentLow = null;
var currentHigh = null;
var showY = true;
var showMt = true;
function applyAllFilters() {
  for (var i = 0; i < markerRecords.length; i++) {
    var rec = markerRecords[i];
    var group = rec.system === 'Y' ? fgY : fgMt;
    var byType = rec.system === 'Y' ? showY : showMt;
    var byYear = true;
    if (currentLow !== null && currentHigh !== null) {
      byYear = rec.year >= currentLow && rec.year <= currentHigh;
    }
    if (byType && byYear) {
      if (!group.hasLayer(rec.layer)) { group.addLayer(rec.layer); }
    } else {
      if (group.hasLayer(rec.layer)) { group.removeLayer(rec.layer); }
    }
  }
}
document.getElementById('ageDropdown').onchange = function () {
  if (this.value === 'all') {
    currentLow = null;
    currentHigh = null;
  } else {
    var parts = this.value.split(',');
    currentLow = parseFloat(parts[0]);
    currentHigh = parseFloat(parts[1]);
  }
  applyAllFilters();
};
document.getElementById('showYChr').onchange = function () {
  showY = this.checked;
  applyAllFilters();
};
document.getElementById('showMtDNA').onchange = function () {
  showMt = this.checked;
  applyAllFilters();
};
"#;

    const TRANSPARENT_COLOR: &str = "rgba(0, 0, 0, 0)";
    const FALLBACK_COLOR: &str = "rgba(128, 128, 128, 0.75)";

    /// Builds the complete self-contained HTML document. Charts are created
    /// lazily on popup open so the canvases exist in the DOM first.
    pub(crate) fn render_document(
        markers: &[PopulationMarker],
        palette: &HashMap<String, String>,
    ) -> Result<String> {
        let (center_lat, center_lon) = map_center(markers);

        let mut payloads = serde_json::Map::new();
        for (i, marker) in markers.iter().enumerate() {
            payloads.insert(format!("chart_{}", i), chart_payload(marker, palette));
        }

        let mut html = String::with_capacity(256 * 1024);
        html.push_str(DOC_HEAD);
        html.push_str("<script>\n");
        writeln!(
            html,
            "var map = L.map('map').setView([{:.4}, {:.4}], 3);",
            center_lat, center_lon
        )?;
        html.push_str(MAP_SETUP);
        writeln!(
            html,
            "var chartPayloads = {};",
            js_value(&serde_json::Value::Object(payloads))?
        )?;
        html.push_str("var markerRecords = [];\n");

        for (i, marker) in markers.iter().enumerate() {
            let tooltip = format!(
                "{} ({})",
                html_escape(&marker.population),
                html_escape(&marker.country)
            );
            let popup = format!(
                "<h4>{} ({})</h4><p>Age: {}, Total: {}</p><p>{}</p>\
                 <canvas id=\"chart_{}\" class=\"haplo-chart\" width=\"620\" height=\"480\"></canvas>",
                html_escape(&marker.population),
                html_escape(&marker.country),
                html_escape(&marker.age_label),
                marker.total,
                marker.marker_system.display_name(),
                i
            );
            let group = match marker.marker_system {
                MarkerSystem::YChromosome => "fgY",
                MarkerSystem::MtDna => "fgMt",
            };
            writeln!(
                html,
                "var m{} = L.marker([{:.4}, {:.4}]).bindTooltip({}).bindPopup({}, {{ maxWidth: 720 }});",
                i,
                marker.lat,
                marker.lon,
                js_string(&tooltip)?,
                js_string(&popup)?
            )?;
            writeln!(html, "m{}.addTo({});", i, group)?;
            writeln!(
                html,
                "markerRecords.push({{ layer: m{}, year: {}, system: '{}' }});",
                i,
                marker.year,
                marker.marker_system.js_tag()
            )?;
        }

        html.push_str(CHART_JS);
        html.push_str(FILTER_JS);
        html.push_str("</script>\n</body>\n</html>\n");
        Ok(html)
    }

    /// Flattens a marker's two rings into the index-aligned arrays the chart
    /// expects: each basal entry is followed by its outer-ring entries, with
    /// zeros on the ring a given entry does not belong to. Undetermined
    /// placeholders are transparent and skipped by legend/tooltip/labels.
    pub(crate) fn chart_payload(
        marker: &PopulationMarker,
        palette: &HashMap<String, String>,
    ) -> serde_json::Value {
        let mut labels = Vec::new();
        let mut inner = Vec::new();
        let mut outer = Vec::new();
        let mut display = Vec::new();
        let mut placeholder = Vec::new();
        let mut colors = Vec::new();

        for slice in &marker.inner_ring {
            labels.push(serde_json::json!(slice.label));
            inner.push(serde_json::json!(round2(slice.span() / 3.6)));
            outer.push(serde_json::json!(0.0));
            display.push(serde_json::Value::Null);
            placeholder.push(serde_json::json!(false));
            colors.push(serde_json::json!(palette
                .get(&slice.label)
                .map(String::as_str)
                .unwrap_or(FALLBACK_COLOR)));

            for child in marker
                .outer_ring
                .iter()
                .filter(|c| c.parent_label.as_deref() == Some(slice.label.as_str()))
            {
                labels.push(serde_json::json!(child.label));
                inner.push(serde_json::json!(0.0));
                outer.push(serde_json::json!(round2(child.span() / 3.6)));
                if child.kind == SliceKind::Undetermined {
                    display.push(serde_json::Value::Null);
                    placeholder.push(serde_json::json!(true));
                    colors.push(serde_json::json!(TRANSPARENT_COLOR));
                } else {
                    display.push(serde_json::json!(round1(child.span() / slice.span() * 100.0)));
                    placeholder.push(serde_json::json!(false));
                    colors.push(serde_json::json!(palette
                        .get(&child.label)
                        .map(String::as_str)
                        .unwrap_or(FALLBACK_COLOR)));
                }
            }
        }

        serde_json::json!({
            "labels": labels,
            "inner": inner,
            "outer": outer,
            "display": display,
            "placeholder": placeholder,
            "colors": colors,
        })
    }

    fn map_center(markers: &[PopulationMarker]) -> (f64, f64) {
        if markers.is_empty() {
            return (20.0, 0.0);
        }
        let n = markers.len() as f64;
        let lat = markers.iter().map(|m| m.lat).sum::<f64>() / n;
        let lon = markers.iter().map(|m| m.lon).sum::<f64>() / n;
        (lat, lon)
    }

    fn js_string(text: &str) -> Result<String> {
        Ok(serde_json::to_string(text)?.replace("</", "<\\/"))
    }

    fn js_value(value: &serde_json::Value) -> Result<String> {
        Ok(serde_json::to_string(value)?.replace("</", "<\\/"))
    }

    fn html_escape(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for ch in text.chars() {
            match ch {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#39;"),
                _ => out.push(ch),
            }
        }
        out
    }

    fn round2(x: f64) -> f64 {
        (x * 100.0).round() / 100.0
    }

    fn round1(x: f64) -> f64 {
        (x * 10.0).round() / 10.0
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::layout::{Ring, RingSlice, SliceKind, UNDETERMINED_LABEL};

        fn slice(
            start: f64,
            end: f64,
            label: &str,
            ring: Ring,
            parent: Option<&str>,
            kind: SliceKind,
        ) -> RingSlice {
            RingSlice {
                start_angle: start,
                end_angle: end,
                label: label.to_string(),
                ring,
                parent_label: parent.map(|p| p.to_string()),
                kind,
            }
        }

        fn marker() -> PopulationMarker {
            PopulationMarker {
                population: "Italy 2000-3000 BP".to_string(),
                country: "Italy".to_string(),
                age_label: "550 BCE".to_string(),
                year: -550,
                total: 10,
                marker_system: MarkerSystem::YChromosome,
                lat: 42.5,
                lon: 13.2,
                inner_ring: vec![
                    slice(0.0, 216.0, "R", Ring::Inner, None, SliceKind::Basal),
                    slice(216.0, 360.0, "J", Ring::Inner, None, SliceKind::Basal),
                ],
                outer_ring: vec![
                    slice(0.0, 108.0, "R1", Ring::Outer, Some("R"), SliceKind::Subclade),
                    slice(108.0, 216.0, "R2", Ring::Outer, Some("R"), SliceKind::Subclade),
                    slice(
                        216.0,
                        360.0,
                        UNDETERMINED_LABEL,
                        Ring::Outer,
                        Some("J"),
                        SliceKind::Undetermined,
                    ),
                ],
            }
        }

        #[test]
        fn payload_arrays_are_index_aligned() {
            let payload = chart_payload(&marker(), &HashMap::new());
            let labels = payload["labels"].as_array().unwrap();
            assert_eq!(labels.len(), 5);
            for key in ["inner", "outer", "display", "placeholder", "colors"] {
                assert_eq!(payload[key].as_array().unwrap().len(), labels.len());
            }
            // [R, R1, R2, J, undetermined]
            assert_eq!(labels[0], "R");
            assert_eq!(labels[3], "J");
            assert_eq!(labels[4], UNDETERMINED_LABEL);
            assert_eq!(payload["placeholder"][4], true);
            assert_eq!(payload["colors"][4], TRANSPARENT_COLOR);
            assert_eq!(payload["display"][1], 50.0);
        }

        #[test]
        fn payload_ring_values_each_sum_to_one_hundred() {
            let payload = chart_payload(&marker(), &HashMap::new());
            let sum = |key: &str| {
                payload[key]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|v| v.as_f64().unwrap())
                    .sum::<f64>()
            };
            assert!((sum("inner") - 100.0).abs() < 0.02);
            assert!((sum("outer") - 100.0).abs() < 0.02);
        }

        #[test]
        fn document_embeds_markers_and_payloads() {
            let html = render_document(&[marker()], &HashMap::new()).unwrap();
            assert!(html.contains("chart_0"));
            assert!(html.contains("Italy 2000-3000 BP"));
            assert!(html.contains("markerRecords.push({ layer: m0, year: -550, system: 'Y' });"));
            assert!(html.contains("m0.addTo(fgY);"));
            assert!(html.contains(UNDETERMINED_LABEL));
        }

        #[test]
        fn empty_marker_set_still_renders_a_map() {
            let html = render_document(&[], &HashMap::new()).unwrap();
            assert!(html.contains("L.map('map').setView([20.0000, 0.0000], 3);"));
            assert!(html.contains("var markerRecords = [];"));
            assert!(html.contains("</html>"));
        }

        #[test]
        fn popup_text_is_html_escaped_and_js_safe() {
            let mut m = marker();
            m.country = "It<a>ly & \"co\"".to_string();
            let html = render_document(&[m], &HashMap::new()).unwrap();
            assert!(html.contains("It&lt;a&gt;ly &amp; &quot;co&quot;"));
            assert!(!html.contains("<a>ly"));
        }
    }
}

mod output_writer {
    use super::annotation::{self, AnnotationTable, MarkerSystem};
    use super::frequency::{HaplogroupFrequencyRow, PartitionMeta};
    use super::{anyhow, fs, warn, BufWriter, Context, File, Path, PathBuf, Result, Write};
    use std::collections::BTreeMap;

    fn create_output_file(path: &Path) -> Result<BufWriter<File>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    anyhow!(
                        "Failed to create output directory {}: {}",
                        parent.display(),
                        e
                    )
                })?;
            }
        }
        File::create(path)
            .map(BufWriter::new)
            .map_err(|e| anyhow!("Failed to create output file {}: {}", path.display(), e))
    }

    /// Re-emits the annotation header plus the retained rows, all columns
    /// untouched, so the filtered file keeps the upstream schema.
    pub(crate) fn write_filtered_annotation(
        path: &Path,
        table: &AnnotationTable,
        retained: &[usize],
        sep: char,
    ) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut writer = csv::WriterBuilder::new()
            .delimiter(sep as u8)
            .from_path(path)
            .with_context(|| format!("Failed to create output file {}", path.display()))?;
        writer.write_record(&table.headers)?;
        for &idx in retained {
            writer.write_record(&table.rows[idx])?;
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_frequency_table(
        path: &Path,
        system: MarkerSystem,
        rows: &[HaplogroupFrequencyRow],
        metas: &BTreeMap<(String, MarkerSystem), PartitionMeta>,
    ) -> Result<()> {
        let mut writer = create_output_file(path)?;
        writeln!(
            writer,
            "population\tcountry\tage\tbp\tlat\tlon\tbasal_haplogroup\tsubclade\tcount\tfrequency\ttotal"
        )?;
        for row in rows.iter().filter(|r| r.marker_system == system) {
            let meta = match metas.get(&(row.population.clone(), system)) {
                Some(meta) => meta,
                None => {
                    warn!(
                        "No metadata for population '{}'; skipping its rows.",
                        row.population
                    );
                    continue;
                }
            };
            let age_label =
                annotation::format_calendar_year(annotation::calendar_year(meta.mean_age_bp));
            write!(
                writer,
                "{}\t{}\t{}\t{:.1}\t",
                row.population, meta.country, age_label, meta.mean_age_bp
            )?;
            if let Some(lat) = meta.lat {
                write!(writer, "{:.4}", lat)?;
            }
            write!(writer, "\t")?;
            if let Some(lon) = meta.lon {
                write!(writer, "{:.4}", lon)?;
            }
            writeln!(
                writer,
                "\t{}\t{}\t{}\t{:.6}\t{}",
                row.basal_haplogroup,
                row.subclade.as_deref().unwrap_or(""),
                row.count,
                row.frequency,
                meta.total
            )?;
        }
        Ok(())
    }

    /// Writes to a sibling temp file and renames into place, so a failed run
    /// never leaves a partial artifact at the target path.
    pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        {
            let mut writer = create_output_file(&tmp_path)?;
            writer
                .write_all(contents.as_bytes())
                .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
            writer.flush()?;
        }
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to move {} into place at {}",
                tmp_path.display(),
                path.display()
            )
        })?;
        Ok(())
    }

}
