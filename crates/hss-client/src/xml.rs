//! Parsing of the subscriber-profile XML document returned by the HSS:
//! registration state, service profiles (public identities plus iFCs) and
//! charging addresses.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{HssError, Result};
use crate::ifc::{AppServer, DefaultHandling, Ifc, Ifcs, Spt, SptPredicate, TriggerPoint};

/// One `<ServiceProfile>`: the public identities sharing it and their iFCs.
#[derive(Debug, Clone, Default)]
pub struct ServiceProfile {
    pub public_identities: Vec<String>,
    pub ifcs: Ifcs,
}

/// The parsed `<ClearwaterRegData>` document.
#[derive(Debug, Clone, Default)]
pub struct RegData {
    pub state: String,
    pub profiles: Vec<ServiceProfile>,
    pub ccfs: Vec<String>,
    pub ecfs: Vec<String>,
}

#[derive(Default)]
struct IfcBuilder {
    priority: i32,
    cnf: bool,
    has_trigger: bool,
    spts: Vec<Spt>,
    server_name: String,
    default_handling: i32,
    service_info: Option<String>,
    include_register_request: bool,
    include_register_response: bool,
}

#[derive(Default)]
struct SptBuilder {
    groups: Vec<u32>,
    negated: bool,
    predicate: Option<SptPredicate>,
    // SIPHeader / SessionDescription accumulate two child values.
    header_or_line: Option<String>,
    content: Option<String>,
}

/// Parse a `<ClearwaterRegData>` document.
pub fn parse_reg_data(input: &str) -> Result<RegData> {
    let mut reader = Reader::from_str(input);
    reader.config_mut().trim_text(true);

    let mut data = RegData::default();
    let mut profile: Option<ServiceProfile> = None;
    let mut profile_ifcs: Vec<Ifc> = Vec::new();
    let mut ifc: Option<IfcBuilder> = None;
    let mut spt: Option<SptBuilder> = None;

    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Err(e) => return Err(HssError::Parse(e.to_string())),
            Ok(Event::Eof) => break,
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
                match name.as_str() {
                    "ServiceProfile" => {
                        profile = Some(ServiceProfile::default());
                        profile_ifcs.clear();
                    }
                    "InitialFilterCriteria" => ifc = Some(IfcBuilder::default()),
                    "TriggerPoint" => {
                        if let Some(b) = ifc.as_mut() {
                            b.has_trigger = true;
                        }
                    }
                    "SPT" => spt = Some(SptBuilder::default()),
                    _ => {}
                }
                path.push(name);
                text.clear();
            }
            Ok(Event::Empty(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
                if let Some(b) = ifc.as_mut() {
                    match name.as_str() {
                        "IncludeRegisterRequest" => b.include_register_request = true,
                        "IncludeRegisterResponse" => b.include_register_response = true,
                        _ => {}
                    }
                }
            }
            Ok(Event::Text(t)) => {
                text = t
                    .unescape()
                    .map_err(|e| HssError::Parse(e.to_string()))?
                    .to_string();
            }
            Ok(Event::End(_)) => {
                let name = match path.pop() {
                    Some(n) => n,
                    None => return Err(HssError::Parse("unbalanced document".to_string())),
                };
                let value = std::mem::take(&mut text);
                handle_end(
                    &name,
                    &path,
                    value,
                    &mut data,
                    &mut profile,
                    &mut profile_ifcs,
                    &mut ifc,
                    &mut spt,
                )?;
            }
            Ok(_) => {}
        }
    }

    if data.state.is_empty() {
        return Err(HssError::Parse("missing RegistrationState".to_string()));
    }
    Ok(data)
}

#[allow(clippy::too_many_arguments)]
fn handle_end(
    name: &str,
    path: &[String],
    value: String,
    data: &mut RegData,
    profile: &mut Option<ServiceProfile>,
    profile_ifcs: &mut Vec<Ifc>,
    ifc: &mut Option<IfcBuilder>,
    spt: &mut Option<SptBuilder>,
) -> Result<()> {
    let parent = path.last().map(String::as_str).unwrap_or("");

    match name {
        "RegistrationState" => data.state = value,
        "CCF" => data.ccfs.push(value),
        "ECF" => data.ecfs.push(value),

        "Identity" if parent == "PublicIdentity" => {
            if let Some(p) = profile.as_mut() {
                p.public_identities.push(value);
            }
        }

        "ServiceProfile" => {
            if let Some(mut p) = profile.take() {
                p.ifcs = Ifcs::new(std::mem::take(profile_ifcs));
                data.profiles.push(p);
            }
        }

        "InitialFilterCriteria" => {
            if let Some(b) = ifc.take() {
                if b.server_name.is_empty() {
                    return Err(HssError::Parse(
                        "InitialFilterCriteria without ServerName".to_string(),
                    ));
                }
                profile_ifcs.push(Ifc {
                    priority: b.priority,
                    trigger: b.has_trigger.then(|| TriggerPoint {
                        condition_type_cnf: b.cnf,
                        spts: b.spts,
                    }),
                    app_server: AppServer {
                        server_name: b.server_name,
                        default_handling: DefaultHandling::from_profile_value(b.default_handling),
                        include_register_request: b.include_register_request,
                        include_register_response: b.include_register_response,
                        service_info: b.service_info,
                    },
                });
            }
        }

        "Priority" => {
            if let Some(b) = ifc.as_mut() {
                b.priority = parse_int(&value, "Priority")?;
            }
        }
        "ConditionTypeCNF" => {
            if let Some(b) = ifc.as_mut() {
                b.cnf = value.trim() == "1";
            }
        }
        "ServerName" => {
            if let Some(b) = ifc.as_mut() {
                b.server_name = value;
            }
        }
        "DefaultHandling" => {
            if let Some(b) = ifc.as_mut() {
                b.default_handling = parse_int(&value, "DefaultHandling")?;
            }
        }
        "ServiceInfo" => {
            if let Some(b) = ifc.as_mut() {
                b.service_info = Some(value);
            }
        }
        "IncludeRegisterRequest" => {
            if let Some(b) = ifc.as_mut() {
                b.include_register_request = true;
            }
        }
        "IncludeRegisterResponse" => {
            if let Some(b) = ifc.as_mut() {
                b.include_register_response = true;
            }
        }

        "SPT" => {
            if let Some(b) = spt.take() {
                if let Some(ifc) = ifc.as_mut() {
                    // An SPT with no recognised predicate never matches;
                    // drop it rather than guessing.
                    if let Some(predicate) = b.predicate {
                        ifc.spts.push(Spt {
                            groups: b.groups,
                            negated: b.negated,
                            predicate,
                        });
                    }
                }
            }
        }
        "ConditionNegated" => {
            if let Some(b) = spt.as_mut() {
                b.negated = value.trim() == "1";
            }
        }
        "Group" => {
            if let Some(b) = spt.as_mut() {
                b.groups.push(parse_int(&value, "Group")? as u32);
            }
        }
        "Method" => {
            if let Some(b) = spt.as_mut() {
                b.predicate = Some(SptPredicate::Method(value));
            }
        }
        "SessionCase" => {
            if let Some(b) = spt.as_mut() {
                b.predicate = Some(SptPredicate::SessionCase(
                    parse_int(&value, "SessionCase")? as u8,
                ));
            }
        }
        "RequestURI" => {
            if let Some(b) = spt.as_mut() {
                b.predicate = Some(SptPredicate::RequestUri(value));
            }
        }
        "Header" | "Line" => {
            if let Some(b) = spt.as_mut() {
                b.header_or_line = Some(value);
            }
        }
        "Content" => {
            if let Some(b) = spt.as_mut() {
                b.content = Some(value);
            }
        }
        "SIPHeader" => {
            if let Some(b) = spt.as_mut() {
                if let Some(header) = b.header_or_line.take() {
                    b.predicate = Some(SptPredicate::SipHeader {
                        header,
                        content: b.content.take(),
                    });
                }
            }
        }
        "SessionDescription" => {
            if let Some(b) = spt.as_mut() {
                if let Some(line) = b.header_or_line.take() {
                    b.predicate = Some(SptPredicate::SessionDescription {
                        line,
                        content: b.content.take(),
                    });
                }
            }
        }

        _ => {}
    }
    Ok(())
}

fn parse_int(value: &str, element: &str) -> Result<i32> {
    value
        .trim()
        .parse()
        .map_err(|_| HssError::Parse(format!("bad integer in <{}>: {}", element, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ClearwaterRegData>
  <RegistrationState>REGISTERED</RegistrationState>
  <IMSSubscription>
    <ServiceProfile>
      <PublicIdentity><Identity>sip:alice@example.com</Identity></PublicIdentity>
      <PublicIdentity><Identity>tel:+16505550001</Identity></PublicIdentity>
      <InitialFilterCriteria>
        <Priority>1</Priority>
        <ApplicationServer>
          <ServerName>sip:mmtel.example.com</ServerName>
          <DefaultHandling>1</DefaultHandling>
        </ApplicationServer>
      </InitialFilterCriteria>
      <InitialFilterCriteria>
        <Priority>0</Priority>
        <TriggerPoint>
          <ConditionTypeCNF>1</ConditionTypeCNF>
          <SPT>
            <ConditionNegated>0</ConditionNegated>
            <Group>0</Group>
            <Method>INVITE</Method>
          </SPT>
          <SPT>
            <Group>1</Group>
            <SIPHeader><Header>Accept-Contact</Header><Content>.*video.*</Content></SIPHeader>
          </SPT>
        </TriggerPoint>
        <ApplicationServer>
          <ServerName>sip:as1.example.com</ServerName>
          <DefaultHandling>0</DefaultHandling>
          <Extension><IncludeRegisterRequest/></Extension>
        </ApplicationServer>
      </InitialFilterCriteria>
    </ServiceProfile>
  </IMSSubscription>
  <ChargingAddresses>
    <CCF>ccf1.example.com</CCF>
    <ECF>ecf1.example.com</ECF>
  </ChargingAddresses>
</ClearwaterRegData>"#;

    #[test]
    fn parses_full_document() {
        let data = parse_reg_data(DOC).unwrap();
        assert_eq!(data.state, "REGISTERED");
        assert_eq!(data.profiles.len(), 1);
        assert_eq!(data.ccfs, vec!["ccf1.example.com"]);
        assert_eq!(data.ecfs, vec!["ecf1.example.com"]);

        let profile = &data.profiles[0];
        assert_eq!(
            profile.public_identities,
            vec!["sip:alice@example.com", "tel:+16505550001"]
        );
        // Sorted by priority.
        let names: Vec<&str> = profile
            .ifcs
            .iter()
            .map(|i| i.app_server.server_name.as_str())
            .collect();
        assert_eq!(names, vec!["sip:as1.example.com", "sip:mmtel.example.com"]);
    }

    #[test]
    fn parses_trigger_point() {
        let data = parse_reg_data(DOC).unwrap();
        let ifc = data.profiles[0].ifcs.get(0).unwrap();
        let tp = ifc.trigger.as_ref().unwrap();
        assert!(tp.condition_type_cnf);
        assert_eq!(tp.spts.len(), 2);
        assert_eq!(
            tp.spts[0].predicate,
            SptPredicate::Method("INVITE".to_string())
        );
        assert_eq!(
            tp.spts[1].predicate,
            SptPredicate::SipHeader {
                header: "Accept-Contact".to_string(),
                content: Some(".*video.*".to_string()),
            }
        );
        assert!(data.profiles[0].ifcs.get(0).unwrap().app_server.include_register_request);
    }

    #[test]
    fn unconditional_ifc_has_no_trigger() {
        let data = parse_reg_data(DOC).unwrap();
        let ifc = data.profiles[0].ifcs.get(1).unwrap();
        assert!(ifc.trigger.is_none());
        assert_eq!(
            ifc.app_server.default_handling,
            DefaultHandling::SessionTerminated
        );
    }

    #[test]
    fn missing_state_is_an_error() {
        assert!(parse_reg_data("<ClearwaterRegData></ClearwaterRegData>").is_err());
    }
}
