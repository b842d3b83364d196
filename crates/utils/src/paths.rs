use directories::ProjectDirs;

const STATE_DIR_ENV: &str = "CONTAINER_USE_STATE_DIR";

pub fn state_dir() -> std::path::PathBuf {
    if let Ok(override_dir) = std::env::var(STATE_DIR_ENV) {
        let override_dir = override_dir.trim();
        if !override_dir.is_empty() {
            let path = std::path::PathBuf::from(override_dir);
            if !path.exists() {
                std::fs::create_dir_all(&path).expect("Failed to create state directory");
            }
            return path;
        }
    }

    let path = ProjectDirs::from("", "", "container-use")
        .expect("OS didn't give us a home directory")
        .data_dir()
        .to_path_buf();

    // Ensure the directory exists
    if !path.exists() {
        std::fs::create_dir_all(&path).expect("Failed to create state directory");
    }

    path
    // ✔ macOS → ~/Library/Application Support/container-use
    // ✔ Linux → ~/.local/share/container-use   (respects XDG_DATA_HOME)
    // ✔ Windows → %APPDATA%\container-use
}

pub fn config_path() -> std::path::PathBuf {
    state_dir().join("config.json")
}
