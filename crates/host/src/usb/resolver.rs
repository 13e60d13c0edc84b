//! Endpoint resolution and interface claiming
//!
//! Walks the descriptor tree of the accessory-mode device to find the bulk
//! pair of the accessory interface and the isochronous endpoint of the audio
//! streaming interface.

use common::{Error, Result, TopologyError, UsbHandle};
use protocol::{
    AccessoryEndpoints, AudioEndpoint, ConfigTree, Direction, InterfaceSelector, ResolvedEndpoint,
    TransferKind, UsbError,
};
use tracing::{debug, info, warn};

/// Every endpoint of every alternate setting matching `selector`
pub fn resolve(config: &ConfigTree, selector: InterfaceSelector) -> Vec<ResolvedEndpoint> {
    config
        .interfaces
        .iter()
        .flat_map(|interface| {
            interface
                .alt_settings
                .iter()
                .filter(move |alt| selector.matches(alt))
                .flat_map(move |alt| {
                    alt.endpoints.iter().map(move |endpoint| ResolvedEndpoint {
                        address: endpoint.address,
                        direction: endpoint.direction(),
                        transfer_kind: endpoint.transfer_kind,
                        interface: interface.number,
                        alternate_setting: alt.setting,
                        packet_size: endpoint.packet_size(),
                    })
                })
        })
        .collect()
}

/// Bulk source and sink of the accessory interface
///
/// Exactly one bulk endpoint per direction is accepted, and both must live on
/// the same interface.
pub fn accessory_endpoints(
    endpoints: &[ResolvedEndpoint],
) -> std::result::Result<AccessoryEndpoints, TopologyError> {
    let source = single_bulk(endpoints, Direction::In)?;
    let sink = single_bulk(endpoints, Direction::Out)?;

    if source.interface != sink.interface {
        return Err(TopologyError::SplitInterfaces {
            sink_interface: sink.interface,
            source_interface: source.interface,
        });
    }

    Ok(AccessoryEndpoints {
        interface: source.interface,
        source: source.address,
        sink: sink.address,
    })
}

fn single_bulk(
    endpoints: &[ResolvedEndpoint],
    direction: Direction,
) -> std::result::Result<ResolvedEndpoint, TopologyError> {
    let mut matching = endpoints
        .iter()
        .filter(|e| e.transfer_kind == TransferKind::Bulk && e.direction == direction);

    let first = matching
        .next()
        .ok_or(TopologyError::MissingEndpoint { direction })?;
    if let Some(second) = matching.next() {
        return Err(TopologyError::DuplicateEndpoint {
            direction,
            first: first.address,
            second: second.address,
        });
    }
    Ok(*first)
}

/// Isochronous IN endpoint used for audio capture
///
/// With an explicit alternate setting, the endpoint of that setting is used.
/// Otherwise the endpoint with the largest packet size wins, the lowest
/// alternate setting breaking ties.
pub fn audio_endpoint(
    endpoints: &[ResolvedEndpoint],
    alternate_setting: Option<u8>,
) -> std::result::Result<AudioEndpoint, TopologyError> {
    let mut candidates = endpoints.iter().filter(|e| {
        e.transfer_kind == TransferKind::Isochronous && e.direction == Direction::In
    });

    let chosen = match alternate_setting {
        Some(setting) => candidates
            .find(|e| e.alternate_setting == setting)
            .ok_or(TopologyError::UnknownAlternateSetting(setting))?,
        None => candidates
            .min_by(|a, b| {
                b.packet_size
                    .cmp(&a.packet_size)
                    .then(a.alternate_setting.cmp(&b.alternate_setting))
            })
            .ok_or(TopologyError::NoAudioEndpoint)?,
    };

    Ok(AudioEndpoint {
        interface: chosen.interface,
        alternate_setting: chosen.alternate_setting,
        address: chosen.address,
        packet_size: chosen.packet_size,
    })
}

/// Detach any kernel driver bound to `interface`, then claim it
pub fn claim_interface<H: UsbHandle>(handle: &mut H, interface: u8) -> Result<()> {
    match handle.kernel_driver_active(interface) {
        Ok(true) => {
            info!("Detaching kernel driver from interface {}", interface);
            handle
                .detach_kernel_driver(interface)
                .map_err(|source| Error::Claim { interface, source })?;
        }
        Ok(false) => {}
        Err(UsbError::NotSupported) => {
            debug!("Kernel driver query not supported on this platform");
        }
        Err(e) => {
            warn!(
                "Failed to query kernel driver on interface {}: {}",
                interface, e
            );
        }
    }

    handle
        .claim_interface(interface)
        .map_err(|source| Error::Claim { interface, source })?;
    debug!("Claimed interface {}", interface);
    Ok(())
}

/// Claim the audio streaming interface and select the capture alternate setting
pub fn claim_audio_interface<H: UsbHandle>(
    handle: &mut H,
    endpoint: &AudioEndpoint,
) -> Result<()> {
    claim_interface(handle, endpoint.interface)?;
    handle
        .set_alternate_setting(endpoint.interface, endpoint.alternate_setting)
        .map_err(|source| Error::AlternateSetting {
            interface: endpoint.interface,
            setting: endpoint.alternate_setting,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::UsbBackend;
    use common::test_utils::{
        MOCK_AUDIO_PACKET_SIZE, MockBackend, accessory_interface, bulk_endpoint,
        create_accessory_config, create_accessory_mode_device, iso_endpoint,
        single_setting_interface,
    };
    use protocol::{AltSetting, InterfaceTree};

    #[test]
    fn test_accessory_pair_on_interface_three() {
        let config = ConfigTree {
            interfaces: vec![
                single_setting_interface(
                    0,
                    0x08,
                    0x06,
                    vec![bulk_endpoint(0x82), bulk_endpoint(0x02)],
                ),
                accessory_interface(3, 0x81, 0x01),
            ],
        };

        let endpoints = resolve(&config, InterfaceSelector::ACCESSORY);
        let pair = accessory_endpoints(&endpoints).unwrap();

        assert_eq!(
            pair,
            AccessoryEndpoints {
                interface: 3,
                source: 0x81,
                sink: 0x01,
            }
        );
    }

    #[test]
    fn test_duplicate_sink_is_rejected() {
        let config = ConfigTree {
            interfaces: vec![single_setting_interface(
                0,
                0xff,
                0xff,
                vec![bulk_endpoint(0x81), bulk_endpoint(0x01), bulk_endpoint(0x02)],
            )],
        };

        let endpoints = resolve(&config, InterfaceSelector::ACCESSORY);
        assert_eq!(
            accessory_endpoints(&endpoints),
            Err(TopologyError::DuplicateEndpoint {
                direction: Direction::Out,
                first: 0x01,
                second: 0x02,
            })
        );
    }

    #[test]
    fn test_missing_source_is_rejected() {
        let config = ConfigTree {
            interfaces: vec![single_setting_interface(0, 0xff, 0xff, vec![bulk_endpoint(0x01)])],
        };

        let endpoints = resolve(&config, InterfaceSelector::ACCESSORY);
        assert_eq!(
            accessory_endpoints(&endpoints),
            Err(TopologyError::MissingEndpoint {
                direction: Direction::In
            })
        );
    }

    #[test]
    fn test_split_interfaces_are_rejected() {
        let config = ConfigTree {
            interfaces: vec![
                single_setting_interface(0, 0xff, 0xff, vec![bulk_endpoint(0x81)]),
                single_setting_interface(1, 0xff, 0xff, vec![bulk_endpoint(0x01)]),
            ],
        };

        let endpoints = resolve(&config, InterfaceSelector::ACCESSORY);
        assert_eq!(
            accessory_endpoints(&endpoints),
            Err(TopologyError::SplitInterfaces {
                sink_interface: 1,
                source_interface: 0,
            })
        );
    }

    #[test]
    fn test_resolve_ignores_other_classes() {
        let endpoints = resolve(&create_accessory_config(), InterfaceSelector::AUDIO_STREAMING);
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].interface, 2);
        assert_eq!(endpoints[0].alternate_setting, 1);
        assert_eq!(endpoints[0].transfer_kind, TransferKind::Isochronous);
        assert_eq!(endpoints[0].packet_size, MOCK_AUDIO_PACKET_SIZE as usize);
    }

    fn multi_setting_audio() -> ConfigTree {
        let alt = |setting: u8, mps: u16| AltSetting {
            setting,
            class: 0x01,
            subclass: 0x02,
            protocol: 0,
            endpoints: vec![iso_endpoint(0x84, mps)],
        };
        ConfigTree {
            interfaces: vec![InterfaceTree {
                number: 4,
                alt_settings: vec![
                    AltSetting {
                        setting: 0,
                        class: 0x01,
                        subclass: 0x02,
                        protocol: 0,
                        endpoints: Vec::new(),
                    },
                    alt(1, 96),
                    alt(2, 192),
                    alt(3, 192),
                ],
            }],
        }
    }

    #[test]
    fn test_audio_prefers_largest_packet_then_lowest_setting() {
        let endpoints = resolve(&multi_setting_audio(), InterfaceSelector::AUDIO_STREAMING);
        let audio = audio_endpoint(&endpoints, None).unwrap();

        assert_eq!(audio.interface, 4);
        assert_eq!(audio.alternate_setting, 2);
        assert_eq!(audio.address, 0x84);
        assert_eq!(audio.packet_size, 192);
    }

    #[test]
    fn test_audio_explicit_alternate_setting() {
        let endpoints = resolve(&multi_setting_audio(), InterfaceSelector::AUDIO_STREAMING);

        let audio = audio_endpoint(&endpoints, Some(1)).unwrap();
        assert_eq!(audio.alternate_setting, 1);
        assert_eq!(audio.packet_size, 96);

        assert_eq!(
            audio_endpoint(&endpoints, Some(0)),
            Err(TopologyError::UnknownAlternateSetting(0))
        );
    }

    #[test]
    fn test_audio_packet_size_includes_multiplier() {
        // 2 additional transactions of 64 bytes
        let config = ConfigTree {
            interfaces: vec![single_setting_interface(
                1,
                0x01,
                0x02,
                vec![iso_endpoint(0x81, (2 << 11) | 64)],
            )],
        };
        let endpoints = resolve(&config, InterfaceSelector::AUDIO_STREAMING);
        assert_eq!(audio_endpoint(&endpoints, None).unwrap().packet_size, 192);
    }

    #[test]
    fn test_no_audio_endpoint() {
        let config = ConfigTree {
            interfaces: vec![accessory_interface(0, 0x81, 0x01)],
        };
        let endpoints = resolve(&config, InterfaceSelector::AUDIO_STREAMING);
        assert_eq!(audio_endpoint(&endpoints, None), Err(TopologyError::NoAudioEndpoint));
    }

    #[test]
    fn test_claim_detaches_active_kernel_driver() {
        let device = create_accessory_mode_device(0x2d04).with_kernel_driver(2);
        let backend = MockBackend::new(vec![device]);
        let devices = backend.devices().unwrap();
        let mut handle = backend.open(&devices[0]).unwrap();

        claim_interface(&mut handle, 0).unwrap();
        let endpoint = AudioEndpoint {
            interface: 2,
            alternate_setting: 1,
            address: 0x83,
            packet_size: 192,
        };
        claim_audio_interface(&mut handle, &endpoint).unwrap();

        assert_eq!(backend.detached(), vec![2]);
        assert_eq!(backend.claimed(), vec![0, 2]);
        assert_eq!(backend.alternate_settings(), vec![(2, 1)]);
    }
}
