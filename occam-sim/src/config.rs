//! Simulation configuration.

use std::path::PathBuf;

use bon::bon;

use crate::{
    resolver::{DEFAULT_CACHE_HIT_RATE, DEFAULT_DEV_OPT_THRESHOLD},
    sched::SchedulerKind,
    workload::{AccessProfile, TraceAccess},
};

/// Everything a [`Runner`](crate::runner::Runner) needs to set up a run:
/// the run folder, the scale selectors of the workload file, the scheduler
/// variant and the tuning knobs of the resolver.
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub folder: String,
    pub gap_scale: String,
    pub exec_scale: String,
    pub scheduler: SchedulerKind,
    pub output: PathBuf,
    pub num_wf: i64,
    pub cache_hit_rate: f64,
    pub use_dev_opt: bool,
    pub dev_opt_threshold: usize,
    pub sanity_check: bool,
    pub data_root: PathBuf,
    pub workload: Option<PathBuf>,
    pub trace_access: TraceAccess,
    pub access_profile: AccessProfile,
}

#[bon]
impl SimConfig {
    #[builder]
    pub fn new(
        /// The run folder holding both the regex caches and the workload.
        #[builder(into, default = "lessdc".to_owned())]
        folder: String,

        /// Gap-time scale; selects the workload file, the times themselves
        /// are already scaled in the trace.
        #[builder(into, default = "1.0".to_owned())]
        gap_scale: String,

        /// Exec-time scale; selects the workload file like `gap_scale`.
        #[builder(into, default = "1.0".to_owned())]
        exec_scale: String,

        #[builder(default = SchedulerKind::OccamDepset)] scheduler: SchedulerKind,

        /// Result path prefix; the writers append `.log`, `.txt`, `_sch.txt`,
        /// `_q_len.txt` and `_active_netobj.txt`.
        #[builder(into, default = PathBuf::from("occam_depset.txt"))]
        output: PathBuf,

        /// Number of workflows to seed; `-1` runs the whole trace.
        #[builder(default = 1000)]
        num_wf: i64,

        #[builder(default = DEFAULT_CACHE_HIT_RATE)] cache_hit_rate: f64,

        #[builder(default = false)] use_dev_opt: bool,

        #[builder(default = DEFAULT_DEV_OPT_THRESHOLD)] dev_opt_threshold: usize,

        /// Run the quadratic structural checks after every scheduling pass.
        #[builder(default = false)]
        sanity_check: bool,

        #[builder(into, default = PathBuf::from("."))] data_root: PathBuf,

        /// Explicit workload file, overriding the folder/scale convention.
        workload: Option<PathBuf>,

        #[builder(default)] trace_access: TraceAccess,

        #[builder(default)] access_profile: AccessProfile,
    ) -> Self {
        SimConfig {
            folder,
            gap_scale,
            exec_scale,
            scheduler,
            output,
            num_wf,
            cache_hit_rate,
            use_dev_opt,
            dev_opt_threshold,
            sanity_check,
            data_root,
            workload,
            trace_access,
            access_profile,
        }
    }

    /// Folder holding `dcs.txt`, `devices.txt`, `regex_device_map.long` and
    /// `reg2fsm.bin`.
    pub fn regex_folder(&self) -> PathBuf {
        self.data_root
            .join("data_process/synthetic_regex")
            .join(&self.folder)
    }

    pub fn workload_path(&self) -> PathBuf {
        match &self.workload {
            Some(path) => path.clone(),
            None => self.data_root.join("workload").join(&self.folder).join(format!(
                "workload_synthetic_gs{}_es{}.txt",
                self.gap_scale, self.exec_scale
            )),
        }
    }

    /// A result file path: the configured output prefix plus a suffix.
    pub fn result_path(&self, suffix: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.output.display(), suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_the_cli_surface() {
        let cfg = SimConfig::builder().build();
        assert_eq!(cfg.folder, "lessdc");
        assert_eq!(cfg.scheduler, SchedulerKind::OccamDepset);
        assert_eq!(cfg.num_wf, 1000);
        assert_eq!(cfg.cache_hit_rate, 0.95);
        assert_eq!(
            cfg.workload_path(),
            PathBuf::from("./workload/lessdc/workload_synthetic_gs1.0_es1.0.txt")
        );
        assert_eq!(
            cfg.result_path(".log"),
            PathBuf::from("occam_depset.txt.log")
        );
    }
}
