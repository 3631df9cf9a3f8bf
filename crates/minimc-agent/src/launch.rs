use std::path::PathBuf;

/// Name of the server artifact inside the data directory.
pub const SERVER_JAR: &str = "server.jar";

/// G1 tuning shared by every launch. Heap sizes are the only operator-adjustable part.
const JVM_FLAGS: &[&str] = &[
    "-XX:+UseG1GC",
    "-XX:+ParallelRefProcEnabled",
    "-XX:+UnlockExperimentalVMOptions",
    "-XX:+DisableExplicitGC",
    "-XX:+AlwaysPreTouch",
    "-XX:G1HeapWastePercent=5",
    "-XX:G1MixedGCCountTarget=4",
    "-XX:MaxGCPauseMillis=50",
    "-XX:G1NewSizePercent=30",
    "-XX:G1MaxNewSizePercent=40",
    "-XX:G1HeapRegionSize=8M",
    "-XX:+PerfDisableSharedMem",
    "-XX:MaxDirectMemorySize=1G",
];

/// Fixed command line for the supervised server. Built from agent config only,
/// never from request input.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub exec: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl LaunchSpec {
    pub fn new(exec: impl Into<String>, args: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            exec: exec.into(),
            args,
            cwd: cwd.into(),
        }
    }

    pub fn paper(java: &str, min_heap: &str, max_heap: &str, cwd: PathBuf) -> Self {
        let mut args = vec![format!("-Xms{min_heap}"), format!("-Xmx{max_heap}")];
        args.extend(JVM_FLAGS.iter().map(|f| f.to_string()));
        args.extend(["-jar".to_string(), SERVER_JAR.to_string(), "nogui".to_string()]);
        Self::new(java, args, cwd)
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            return self.exec.clone();
        }
        format!("{} {}", self.exec, self.args.join(" "))
    }
}
