use std::net::Ipv4Addr;

use log::info;
use serde::{Deserialize, Serialize};

use crate::{error::ProvisioningError, state::PersistentState};

pub use crate::config::RecoveryExitPolicy;

/// Body posted by the provisioning page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProvisioningForm {
    pub ssid: String,
    #[serde(default)]
    pub pass: String,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningResponse {
    pub ssid: String,
    pub ip: String,
    pub restarting: bool,
}

impl ProvisioningForm {
    pub fn validate(&self) -> Result<(), ProvisioningError> {
        let ssid = self.ssid.trim();
        if ssid.is_empty() {
            return Err(ProvisioningError::EmptySsid);
        }
        if ssid.len() > 32 {
            return Err(ProvisioningError::SsidTooLong);
        }
        if self.pass.len() > 64 {
            return Err(ProvisioningError::PasswordTooLong);
        }
        self.ip
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| ProvisioningError::InvalidIp(self.ip.clone()))?;
        Ok(())
    }

    /// Validates the form, stores the credentials in `state` and clears the
    /// retry bookkeeping so the next boot starts from a clean slate.
    pub fn apply_to(&self, state: &mut PersistentState) -> Result<ProvisioningResponse, ProvisioningError> {
        self.validate()?;

        state.network.wifi_ssid = self.ssid.trim().to_string();
        state.network.wifi_pass = self.pass.clone();
        state.network.server_ip = self.ip.trim().to_string();
        state.link.reset_after_provisioning();
        info!(
            "provisioned ssid `{}`, server {}",
            state.network.wifi_ssid, state.network.server_ip
        );

        Ok(ProvisioningResponse {
            ssid: state.network.wifi_ssid.clone(),
            ip: state.network.server_ip.clone(),
            restarting: true,
        })
    }
}

pub const PROVISIONING_PAGE_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Sky Monitor Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:560px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input[type=text],input[type=password]{width:100%;padding:.5rem;box-sizing:border-box}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>Sky Monitor Setup</h1>
  <p class="muted">The node could not reach its network or collection server.</p>

  <div class="card">
    <label>WiFi SSID</label><input id="ssid" type="text">
    <label>WiFi Password</label><input id="pass" type="password">
    <label>Server IP</label><input id="ip" type="text" placeholder="192.168.43.130">
    <button id="save">Save and Restart</button>
  </div>

  <p id="status" class="muted"></p>

  <script>
    const q=(id)=>document.getElementById(id);

    q('save').addEventListener('click', async ()=>{
      q('status').className='muted'; q('status').textContent='Saving...';
      try{
        const payload={ssid:q('ssid').value.trim(),pass:q('pass').value,ip:q('ip').value.trim()};
        const r=await fetch('/',{method:'POST',headers:{'content-type':'application/json'},body:JSON.stringify(payload)});
        let b={};try{b=await r.json();}catch(_){}
        if(!r.ok)throw new Error(b.error||('Request failed: '+r.status));
        q('status').className='ok'; q('status').textContent='Saved. Restarting and connecting to '+b.ssid+'.';
      }catch(err){q('status').className='err'; q('status').textContent=err.message;}
    });
  </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::NodeConfig;

    fn form(ssid: &str, ip: &str) -> ProvisioningForm {
        ProvisioningForm {
            ssid: ssid.to_string(),
            pass: "secret".to_string(),
            ip: ip.to_string(),
        }
    }

    #[test]
    fn rejects_bad_forms() {
        assert_eq!(form("  ", "10.0.0.2").validate(), Err(ProvisioningError::EmptySsid));
        assert_eq!(
            form("observatory", "10.0.0").validate(),
            Err(ProvisioningError::InvalidIp("10.0.0".to_string()))
        );
        assert_eq!(
            form(&"x".repeat(33), "10.0.0.2").validate(),
            Err(ProvisioningError::SsidTooLong)
        );
    }

    #[test]
    fn applying_clears_retry_bookkeeping() {
        let mut state = PersistentState::new(&NodeConfig::default());
        state.link.no_wifi_count = 3;
        state.link.server_error_count = 1;
        state.link.settings_loaded = true;

        let response = form(" observatory ", "10.0.0.2").apply_to(&mut state).unwrap();

        assert_eq!(response.ssid, "observatory");
        assert_eq!(state.network.wifi_pass, "secret");
        assert_eq!(state.network.fetch_url(), "http://10.0.0.2:5000/getsettings");
        assert_eq!(state.link.no_wifi_count, 0);
        assert!(!state.link.settings_loaded);
    }

    #[test]
    fn invalid_form_leaves_state_alone() {
        let mut state = PersistentState::new(&NodeConfig::default());
        state.link.no_wifi_count = 3;
        let before = state.clone();

        assert!(form("observatory", "nope").apply_to(&mut state).is_err());
        assert_eq!(state, before);
    }

    #[test]
    fn form_accepts_missing_password() {
        let form: ProvisioningForm =
            serde_json::from_str(r#"{"ssid":"open-net","ip":"192.168.1.20"}"#).unwrap();
        assert!(form.validate().is_ok());
        assert_eq!(form.pass, "");
    }
}
