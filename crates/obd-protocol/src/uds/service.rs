//! UDS service layer

use super::{parse_did_data, parse_uds_response, service_id, DidReading};
use crate::codec::response_bytes;
use crate::driver::Elm327Driver;
use crate::error::ObdError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Time the ECU is given to restart after a positive reset response
pub const ECU_RESET_SETTLE: Duration = Duration::from_millis(5000);

/// UDS requests carried as hex text through the command driver
#[derive(Clone)]
pub struct UdsService {
    driver: Arc<Elm327Driver>,
    reset_settle: Duration,
}

impl UdsService {
    pub fn new(driver: Arc<Elm327Driver>) -> Self {
        Self {
            driver,
            reset_settle: ECU_RESET_SETTLE,
        }
    }

    pub fn with_reset_settle(mut self, settle: Duration) -> Self {
        self.reset_settle = settle;
        self
    }

    async fn request(&self, service: u8, command: &str) -> Result<Vec<u8>, ObdError> {
        let response = self.driver.send_command(command).await?;
        let bytes = response_bytes(&response);
        let payload = parse_uds_response(&bytes, service)?;
        debug!("[uds] {} -> {:02X?}", command, payload);
        Ok(payload.to_vec())
    }

    /// Diagnostic session control (0x10)
    pub async fn switch_session(&self, session: u8) -> Result<(), ObdError> {
        let command = format!("{:02X}{:02X}", service_id::DIAGNOSTIC_SESSION_CONTROL, session);
        self.request(service_id::DIAGNOSTIC_SESSION_CONTROL, &command)
            .await?;
        info!("[uds] session 0x{:02X} active", session);
        Ok(())
    }

    /// Read data by identifier (0x22)
    pub async fn read_data_by_identifier(&self, did: u16) -> Result<DidReading, ObdError> {
        let command = format!("{:02X}{:04X}", service_id::READ_DATA_BY_ID, did);
        let payload = self.request(service_id::READ_DATA_BY_ID, &command).await?;

        let [hi, lo, data @ ..] = payload.as_slice() else {
            return Err(ObdError::Protocol(format!(
                "truncated response to DID 0x{:04X}",
                did
            )));
        };
        let echoed = u16::from_be_bytes([*hi, *lo]);
        if echoed != did {
            warn!("[uds] asked for DID 0x{:04X}, ECU answered 0x{:04X}", did, echoed);
        }
        Ok(DidReading {
            did: echoed,
            data: data.to_vec(),
            value: parse_did_data(echoed, data),
        })
    }

    /// Read several DIDs one after another; failures are logged and skipped
    pub async fn read_multiple_data_by_identifier(&self, dids: &[u16]) -> Vec<DidReading> {
        let mut readings = Vec::with_capacity(dids.len());
        for &did in dids {
            match self.read_data_by_identifier(did).await {
                Ok(reading) => readings.push(reading),
                Err(e) => warn!("[uds] failed to read DID 0x{:04X}: {}", did, e),
            }
        }
        readings
    }

    /// ECU reset (0x11). Refused unless `confirmed`; waits for the ECU to
    /// restart before returning.
    pub async fn ecu_reset(&self, reset_type: u8, confirmed: bool) -> Result<(), ObdError> {
        if !confirmed {
            return Err(ObdError::ConfirmationRequired);
        }
        let command = format!("{:02X}{:02X}", service_id::ECU_RESET, reset_type);
        self.request(service_id::ECU_RESET, &command).await?;
        info!(
            "[uds] ECU reset 0x{:02X} accepted, waiting {:?}",
            reset_type, self.reset_settle
        );
        tokio::time::sleep(self.reset_settle).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverOptions;
    use crate::transport::{RuntimeEnvironment, SimulatedTransport};
    use crate::uds::{did, reset_type, session, DidValue, NegativeResponseCode};
    use tokio::time::Instant;

    async fn service() -> (Arc<SimulatedTransport>, UdsService) {
        let sim = Arc::new(SimulatedTransport::new(RuntimeEnvironment::Development).unwrap());
        let driver = Arc::new(Elm327Driver::new(sim.clone(), DriverOptions::default()));
        driver.open().await.unwrap();
        (sim, UdsService::new(driver))
    }

    #[tokio::test]
    async fn test_read_vin() {
        let (sim, uds) = service().await;
        sim.set_response("22F190", "62 F1 90 31 32 33");

        let reading = uds.read_data_by_identifier(did::VIN).await.unwrap();
        assert_eq!(reading.did, 0xF190);
        assert_eq!(reading.value, DidValue::Text("123".to_string()));
        assert_eq!(sim.written().last().map(String::as_str), Some("22F190"));
    }

    #[tokio::test]
    async fn test_negative_response_is_typed() {
        let (sim, uds) = service().await;
        sim.set_response("22F190", "7F 22 31");

        match uds.read_data_by_identifier(did::VIN).await {
            Err(ObdError::NegativeResponse { service_id, nrc }) => {
                assert_eq!(service_id, 0x22);
                assert_eq!(u8::from(nrc), 0x31);
                assert_eq!(nrc, NegativeResponseCode::RequestOutOfRange);
            }
            other => panic!("expected negative response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_multiple_skips_failures() {
        let (sim, uds) = service().await;
        sim.set_response("220102", "62 01 02 50");
        sim.set_response("220103", "7F 22 31");
        sim.set_response("220110", "62 01 10 5A");

        let readings = uds
            .read_multiple_data_by_identifier(&[0x0102, 0x0103, 0x0110])
            .await;
        let dids: Vec<u16> = readings.iter().map(|r| r.did).collect();
        assert_eq!(dids, vec![0x0102, 0x0110]);
        assert_eq!(readings[1].value, DidValue::Number(50.0));
    }

    #[tokio::test]
    async fn test_switch_session() {
        let (sim, uds) = service().await;
        sim.set_response("1003", "50 03 00 32 01 F4");
        uds.switch_session(session::EXTENDED).await.unwrap();

        sim.set_response("1002", "7F 10 22");
        assert!(matches!(
            uds.switch_session(session::PROGRAMMING).await,
            Err(ObdError::NegativeResponse { service_id: 0x10, .. })
        ));
    }

    #[tokio::test]
    async fn test_ecu_reset_requires_confirmation() {
        let (sim, uds) = service().await;
        assert!(matches!(
            uds.ecu_reset(reset_type::HARD_RESET, false).await,
            Err(ObdError::ConfirmationRequired)
        ));
        assert!(!sim.written().iter().any(|c| c.starts_with("11")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ecu_reset_waits_for_restart() {
        let (sim, uds) = service().await;
        sim.set_response("1101", "51 01");

        let started = Instant::now();
        uds.ecu_reset(reset_type::HARD_RESET, true).await.unwrap();
        assert!(started.elapsed() >= ECU_RESET_SETTLE);
    }
}
